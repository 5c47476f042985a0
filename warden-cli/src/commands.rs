//! CLI subcommand handlers.

use crate::request_log::JsonlRequestLog;
use crate::{Commands, ConfigAction};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use warden_core::config::load_config;
use warden_core::{CoordinatorBuilder, RequestRecord, SecurityRuntime, SignatureDetector, WardenConfig};

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, config_path: Option<&Path>) -> anyhow::Result<()> {
    match command {
        Commands::Run {
            request_log,
            gateway,
        } => handle_run(config_path, request_log.as_deref(), gateway).await,
        Commands::ScanRequest {
            url,
            ip,
            method,
            body,
            user_agent,
            headers,
        } => {
            let mut request = RequestRecord::new(ip, url, Utc::now());
            request.method = method;
            if let Some(body) = body {
                request = request.with_body(body);
            }
            if let Some(agent) = user_agent {
                request = request.with_user_agent(agent);
            }
            for header in headers {
                let (name, value) = header
                    .split_once('=')
                    .ok_or_else(|| anyhow::anyhow!("Header '{header}' is not NAME=VALUE"))?;
                request = request.with_header(name.trim(), value.trim());
            }
            let detector = signature_detector(config_path)?;
            print_json(&detector.scan_request(&request))
        }
        Commands::ScanScript { file, origin } => {
            let content = tokio::fs::read_to_string(&file).await?;
            let origin = origin.unwrap_or_else(|| file.display().to_string());
            let detector = signature_detector(config_path)?;
            print_json(&detector.scan_script(&content, &origin))
        }
        Commands::Assess => {
            let config = load(config_path)?;
            let coordinator = CoordinatorBuilder::new(config).build()?;
            print_json(&coordinator.perform_security_assessment())
        }
        Commands::Config { action } => handle_config(action, config_path),
    }
}

fn load(config_path: Option<&Path>) -> anyhow::Result<WardenConfig> {
    load_config(config_path).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))
}

fn signature_detector(config_path: Option<&Path>) -> anyhow::Result<SignatureDetector> {
    let config = load(config_path)?;
    Ok(SignatureDetector::new(config.signatures.resolve_rules()?)?)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn handle_config(action: ConfigAction, config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load(config_path)?;
    match action {
        ConfigAction::Show => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        ConfigAction::Validate => match config.validate() {
            Ok(()) => {
                println!("Configuration is valid.");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Configuration is invalid: {}", e)),
        },
    }
}

async fn handle_run(
    config_path: Option<&Path>,
    request_log: Option<&Path>,
    force_gateway: bool,
) -> anyhow::Result<()> {
    let config = load(config_path)?;
    let gateway_addr = (config.gateway.enabled || force_gateway)
        .then(|| config.gateway.socket_addr())
        .transpose()?;

    let mut builder = CoordinatorBuilder::new(config);
    if let Some(path) = request_log {
        tracing::info!(path = %path.display(), "Tailing request log");
        builder = builder.with_request_log(Arc::new(JsonlRequestLog::new(path)));
    }
    let coordinator = Arc::new(builder.build()?);
    let runtime = SecurityRuntime::start(coordinator.clone());

    let gateway = gateway_addr.map(|addr| {
        let token = runtime.cancellation_token();
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            if let Err(e) = warden_core::gateway::serve(coordinator, addr, token).await {
                tracing::error!(error = %e, "Gateway stopped");
            }
        })
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupt received");

    let report = runtime.shutdown().await;
    if let Some(gateway) = gateway {
        let _ = gateway.await;
    }
    println!(
        "Stopped: {} alert(s) drained, {} abandoned.",
        report.drained, report.abandoned
    );
    Ok(())
}

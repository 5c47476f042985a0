//! HTTP gateway over the coordinator's public API.

use crate::coordinator::Coordinator;
use crate::error::{EventError, IncidentError};
use crate::event::RawThreatReport;
use crate::incident::IncidentReport;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

type Shared = Arc<Coordinator>;

/// JSON error body with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

impl From<IncidentError> for ApiError {
    fn from(e: IncidentError) -> Self {
        let status = match e {
            IncidentError::NotFound(_) => StatusCode::NOT_FOUND,
            IncidentError::InvalidTransition { .. } => StatusCode::CONFLICT,
            IncidentError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<EventError> for ApiError {
    fn from(e: EventError) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AssignRequest {
    assignee: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TransitionRequest {
    actor: String,
    note: Option<String>,
}

impl Default for TransitionRequest {
    fn default() -> Self {
        Self {
            actor: "api".into(),
            note: None,
        }
    }
}

pub fn router(coordinator: Shared) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/metrics", get(metrics_handler))
        .route("/api/status", get(status_handler))
        .route("/api/dashboard", get(dashboard_handler))
        .route("/api/assessment", post(assessment_handler))
        .route("/api/threats", post(report_threat_handler))
        .route("/api/incidents", post(report_incident_handler))
        .route("/api/incidents/{id}", get(incident_handler))
        .route("/api/incidents/{id}/assign", post(assign_handler))
        .route("/api/incidents/{id}/start", post(start_handler))
        .route("/api/incidents/{id}/resolve", post(resolve_handler))
        .route("/api/incidents/{id}/reopen", post(reopen_handler))
        .route("/api/incidents/{id}/close", post(close_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(coordinator)
}

async fn health_handler(State(c): State<Shared>) -> impl IntoResponse {
    let snapshot = c.health_monitor().last_snapshot();
    Json(serde_json::json!({
        "status": snapshot.overall,
        "modules": snapshot.modules.len(),
        "checked_at": snapshot.checked_at,
    }))
}

async fn metrics_handler(State(c): State<Shared>) -> impl IntoResponse {
    Json(c.threat_metrics())
}

async fn status_handler(State(c): State<Shared>) -> impl IntoResponse {
    Json(c.security_status())
}

async fn dashboard_handler(State(c): State<Shared>) -> impl IntoResponse {
    Json(c.executive_dashboard())
}

async fn assessment_handler(State(c): State<Shared>) -> impl IntoResponse {
    Json(c.perform_security_assessment())
}

async fn report_threat_handler(
    State(c): State<Shared>,
    Json(raw): Json<RawThreatReport>,
) -> Result<Response, ApiError> {
    Ok(match c.report_threat(raw).await? {
        Some(outcome) => (StatusCode::CREATED, Json(outcome)).into_response(),
        None => Json(serde_json::json!({ "duplicate": true })).into_response(),
    })
}

async fn report_incident_handler(
    State(c): State<Shared>,
    Json(report): Json<IncidentReport>,
) -> impl IntoResponse {
    let id = c.report_security_incident(report);
    (StatusCode::CREATED, Json(serde_json::json!({ "id": id })))
}

async fn incident_handler(
    State(c): State<Shared>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let incident = c.incident(&id).ok_or(IncidentError::NotFound(id))?;
    Ok(Json(incident).into_response())
}

async fn assign_handler(
    State(c): State<Shared>,
    Path(id): Path<String>,
    Json(req): Json<AssignRequest>,
) -> Result<Response, ApiError> {
    let assignee = c.assign_incident(&id, req.assignee.as_deref())?;
    Ok(Json(serde_json::json!({ "id": id, "assigned_to": assignee })).into_response())
}

async fn start_handler(
    State(c): State<Shared>,
    Path(id): Path<String>,
    Json(req): Json<TransitionRequest>,
) -> Result<Response, ApiError> {
    c.start_incident(&id, &req.actor)?;
    current(&c, id)
}

async fn resolve_handler(
    State(c): State<Shared>,
    Path(id): Path<String>,
    Json(req): Json<TransitionRequest>,
) -> Result<Response, ApiError> {
    c.resolve_incident(&id, &req.actor, req.note.as_deref())?;
    current(&c, id)
}

async fn reopen_handler(
    State(c): State<Shared>,
    Path(id): Path<String>,
    Json(req): Json<TransitionRequest>,
) -> Result<Response, ApiError> {
    c.reopen_incident(&id, &req.actor, req.note.as_deref())?;
    current(&c, id)
}

async fn close_handler(
    State(c): State<Shared>,
    Path(id): Path<String>,
    Json(req): Json<TransitionRequest>,
) -> Result<Response, ApiError> {
    c.close_incident(&id, &req.actor)?;
    current(&c, id)
}

fn current(c: &Coordinator, id: String) -> Result<Response, ApiError> {
    let incident = c.incident(&id).ok_or(IncidentError::NotFound(id))?;
    Ok(Json(incident).into_response())
}

/// Serve until `token` is cancelled.
pub async fn serve(
    coordinator: Shared,
    addr: SocketAddr,
    token: CancellationToken,
) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Gateway listening");
    axum::serve(listener, router(coordinator))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WardenConfig;
    use crate::coordinator::CoordinatorBuilder;
    use axum::body::Body;
    use tower::ServiceExt;

    fn app() -> (Router, Shared) {
        let mut config = WardenConfig::default();
        config.alerts.channels.console = false;
        let coordinator = Arc::new(CoordinatorBuilder::new(config).build().unwrap());
        (router(coordinator.clone()), coordinator)
    }

    async fn call(app: Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let builder = axum::http::Request::builder().method(method).uri(uri);
        let req = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = ServiceExt::<axum::http::Request<Body>>::oneshot(app, req)
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1_000_000).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (app, _) = app();
        let (status, json) = call(app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "HEALTHY");
    }

    #[tokio::test]
    async fn test_report_threat_endpoint() {
        let (app, coordinator) = app();
        let body = serde_json::json!({"type": "AUTH_FAILURE", "severity": "low", "source": "10.0.0.1"});
        let (status, json) = call(app, "POST", "/api/threats", Some(body)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["threat"]["type"], "AUTH_FAILURE");
        assert_eq!(coordinator.registry().active_count(), 1);
    }

    #[tokio::test]
    async fn test_report_threat_rejects_missing_type() {
        let (app, _) = app();
        let body = serde_json::json!({"source": "10.0.0.1"});
        let (status, json) = call(app, "POST", "/api/threats", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("type"));
    }

    #[tokio::test]
    async fn test_incident_lifecycle_endpoints() {
        let (app, _) = app();
        let (status, json) = call(
            app.clone(),
            "POST",
            "/api/incidents",
            Some(serde_json::json!({"title": "Port scan", "category": "network", "severity": "HIGH"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = json["id"].as_str().unwrap().to_string();

        let (_, json) = call(app.clone(), "POST", &format!("/api/incidents/{id}/assign"), Some(serde_json::json!({}))).await;
        assert_eq!(json["assigned_to"], "network-operations");

        let (status, json) = call(app.clone(), "POST", &format!("/api/incidents/{id}/start"), Some(serde_json::json!({"actor": "alice"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "IN_PROGRESS");

        let (status, _) = call(app.clone(), "POST", &format!("/api/incidents/{id}/close"), Some(serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_unknown_incident_is_not_found() {
        let (app, _) = app();
        let (status, _) = call(app, "POST", "/api/incidents/INC-999999/start", Some(serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_snapshot_endpoints() {
        let (app, _) = app();
        for uri in ["/api/metrics", "/api/status", "/api/dashboard"] {
            let (status, _) = call(app.clone(), "GET", uri, None).await;
            assert_eq!(status, StatusCode::OK, "{uri}");
        }
        let (status, json) = call(app, "POST", "/api/assessment", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["posture"]["score"].is_number());
    }
}

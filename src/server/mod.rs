use crate::dispatch::{QueryParams, Reply, ResponseSink};
use crate::model::RemoteResponse;
use crate::service::RemoteService;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio::sync::watch;

const REMOTE_JS: &str = include_str!("../../assets/remote.js");

pub fn router(service: Arc<RemoteService>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/remote.html", get(remote_page))
        .route("/remote.js", get(remote_script))
        .route("/remote", get(remote_action))
        .with_state(service)
}

pub async fn start(
    addr: SocketAddr,
    service: Arc<RemoteService>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "http server listening");
    axum::serve(listener, router(service))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await?;

    Ok(())
}

async fn remote_page(State(service): State<Arc<RemoteService>>) -> Response {
    match service.render_page().await {
        Some(page) => Html(page).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "Remote page not loaded yet").into_response(),
    }
}

async fn remote_script() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/javascript; charset=utf-8")],
        REMOTE_JS,
    )
}

async fn remote_action(
    State(service): State<Arc<RemoteService>>,
    Query(query): Query<QueryParams>,
) -> Response {
    let (sink, rx) = ResponseSink::channel();
    if !service.execute_query(&query, Some(sink)) {
        let input = serde_json::to_string(&query).unwrap_or_default();
        tracing::warn!(%input, "unknown remote command");
        return Json(RemoteResponse::unknown_command(&input)).into_response();
    }

    match rx.await {
        Ok(Reply::Status(response)) => Json(response).into_response(),
        Ok(Reply::Snapshot(snapshot)) => Json(snapshot).into_response(),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RemoteResponse::failure("unknown", "action finished without a reply")),
        )
            .into_response(),
    }
}

async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "healthy",
            "timestamp": std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{CommandError, CommandOutput, CommandRunner};
    use crate::config::Config;
    use crate::model::{ConfigSnapshot, ModuleDescriptor};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    struct OkRunner;

    #[async_trait::async_trait]
    impl CommandRunner for OkRunner {
        async fn run(&self, _command: &str, _limit: Duration) -> Result<CommandOutput, CommandError> {
            Ok(CommandOutput {
                exit_code: Some(0),
                ..Default::default()
            })
        }
    }

    fn service() -> Arc<RemoteService> {
        let mut config = Config::default();
        config.remote.update_timeout_ms = 50;
        RemoteService::new(&config, Arc::new(OkRunner))
    }

    async fn get(service: Arc<RemoteService>, uri: &str) -> (StatusCode, String) {
        let response = router(service)
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let (status, body) = get(service(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["status"], "healthy");
    }

    #[tokio::test]
    async fn page_unavailable_until_template_loads() {
        let service = service();
        let (status, _) = get(service.clone(), "/remote.html").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        service.set_template("<b>%%REPLACE::BRIGHTNESS%%</b>".to_string());
        let (status, body) = get(service, "/remote.html").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "<b>100</b>");
    }

    #[tokio::test]
    async fn script_is_served_as_javascript() {
        let response = router(service())
            .oneshot(Request::get("/remote.js").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/javascript; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn known_action_returns_success() {
        let (status, body) = get(service(), "/remote?action=REFRESH").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_str::<Value>(&body).unwrap(), json!({"status": "success"}));
    }

    #[tokio::test]
    async fn unknown_action_echoes_query() {
        let (status, body) = get(service(), "/remote?action=SELF_DESTRUCT&module=x").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            serde_json::from_str::<Value>(&body).unwrap(),
            json!({
                "status": "error",
                "reason": "unknown_command",
                "info": "original input: {\"action\":\"SELF_DESTRUCT\",\"module\":\"x\"}"
            })
        );
    }

    #[tokio::test]
    async fn missing_action_is_unknown_command() {
        let (_, body) = get(service(), "/remote").await;
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["reason"], "unknown_command");
        assert_eq!(value["info"], "original input: {}");
    }

    #[tokio::test]
    async fn module_data_returns_snapshot_json() {
        let service = service();
        service.apply_snapshot(ConfigSnapshot {
            brightness: Some(serde_json::json!(70)),
            module_data: Some(vec![ModuleDescriptor {
                identifier: "module_1_clock".to_string(),
                name: "clock".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });

        let (status, body) = get(service, "/remote?action=MODULE_DATA").await;
        assert_eq!(status, StatusCode::OK);
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["brightness"], 70);
        assert_eq!(value["moduleData"][0]["identifier"], "module_1_clock");
    }
}

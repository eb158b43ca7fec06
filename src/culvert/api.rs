use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::culvert::registry::{Registry, TunnelKind};
use crate::culvert::tunnel::{
    DEFAULT_CONTROL_PORT, TunnelError, client::ClientOptions, server::ServerOptions,
    shutdown_requested,
};

#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<Registry>,
    pub prometheus: Arc<PrometheusHandle>,
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: ApiState,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("api: bind {addr}"))?;
    tracing::info!(api_addr = %addr, "api: listening");
    serve_listener(listener, state, shutdown).await
}

async fn serve_listener(
    listener: tokio::net::TcpListener,
    state: ApiState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = router(Arc::new(state));
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown_requested(&mut shutdown).await })
        .await?;
    Ok(())
}

fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/tunnels", get(tunnels))
        .route("/api/status/{id}", get(status))
        .route("/api/server/start", post(server_start))
        .route("/api/server/{id}/stop", post(server_stop))
        .route("/api/client/start", post(client_start))
        .route("/api/client/{id}/stop", post(client_stop))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Deserialize)]
struct ServerStartRequest {
    min_port: u16,
    max_port: u16,
    bind_addr: String,
    bind_tunnels: Option<String>,
    control_port: Option<u16>,
    secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClientStartRequest {
    to: String,
    local_host: String,
    local_port: u16,
    port: u16,
    control_port: Option<u16>,
    secret: Option<String>,
}

#[derive(Debug, Serialize)]
struct StartResponse {
    id: Uuid,
}

#[derive(Debug, Serialize)]
struct StopResponse {
    success: bool,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

async fn metrics(State(st): State<Arc<ApiState>>) -> impl IntoResponse {
    st.prometheus.render()
}

async fn tunnels(State(st): State<Arc<ApiState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.registry.snapshot()))
}

async fn status(State(st): State<Arc<ApiState>>, Path(id): Path<Uuid>) -> Response {
    match st.registry.info(&id) {
        Some(info) => (StatusCode::OK, Json(info)).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("no tunnel {id}")),
    }
}

async fn server_start(
    State(st): State<Arc<ApiState>>,
    payload: Result<Json<ServerStartRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(json) => json,
        Err(rej) => return error_response(StatusCode::BAD_REQUEST, rej.body_text()),
    };

    let res = st.registry.start_server(ServerOptions {
        bind_addr: req.bind_addr,
        bind_tunnels: req.bind_tunnels,
        control_port: req.control_port.unwrap_or(DEFAULT_CONTROL_PORT),
        min_port: req.min_port,
        max_port: req.max_port,
        secret: req.secret,
    });
    match res {
        Ok(id) => (StatusCode::OK, Json(StartResponse { id })).into_response(),
        Err(err) => start_error(err),
    }
}

async fn client_start(
    State(st): State<Arc<ApiState>>,
    payload: Result<Json<ClientStartRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(json) => json,
        Err(rej) => return error_response(StatusCode::BAD_REQUEST, rej.body_text()),
    };

    let res = st.registry.start_client(ClientOptions {
        to: req.to,
        control_port: req.control_port.unwrap_or(DEFAULT_CONTROL_PORT),
        local_host: req.local_host,
        local_port: req.local_port,
        port: req.port,
        secret: req.secret,
        dial_timeout: Duration::ZERO,
    });
    match res {
        Ok(id) => (StatusCode::OK, Json(StartResponse { id })).into_response(),
        Err(err) => start_error(err),
    }
}

async fn server_stop(State(st): State<Arc<ApiState>>, Path(id): Path<Uuid>) -> Response {
    stop_response(st.registry.stop(&id, TunnelKind::Server).await, &id)
}

async fn client_stop(State(st): State<Arc<ApiState>>, Path(id): Path<Uuid>) -> Response {
    stop_response(st.registry.stop(&id, TunnelKind::Client).await, &id)
}

fn stop_response(stopped: bool, id: &Uuid) -> Response {
    if stopped {
        (StatusCode::OK, Json(StopResponse { success: true })).into_response()
    } else {
        error_response(StatusCode::NOT_FOUND, format!("no tunnel {id}"))
    }
}

fn start_error(err: TunnelError) -> Response {
    match err {
        TunnelError::Config(msg) => error_response(StatusCode::BAD_REQUEST, msg),
        other => error_response(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    }
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorResponse { error })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::culvert::tunnel::TunnelStatus;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn test_state() -> ApiState {
        ApiState {
            registry: Arc::new(Registry::new()),
            prometheus: Arc::new(PrometheusBuilder::new().build_recorder().handle()),
        }
    }

    async fn serve_for_tests(state: ApiState) -> (SocketAddr, watch::Sender<bool>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            serve_listener(listener, state, shutdown_rx).await.unwrap();
        });
        (addr, shutdown_tx)
    }

    /// Minimal HTTP/1.1 round trip, enough to exercise the router end to end.
    async fn http(addr: SocketAddr, method: &str, path: &str, body: Option<&str>) -> (u16, String) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let body = body.unwrap_or("");
        let req = format!(
            "{method} {path} HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();
        let text = String::from_utf8_lossy(&raw).to_string();
        let status: u16 = text
            .split_whitespace()
            .nth(1)
            .expect("status line")
            .parse()
            .expect("status code");
        let payload = text
            .split_once("\r\n\r\n")
            .map(|(_, b)| b.to_string())
            .unwrap_or_default();
        (status, payload)
    }

    async fn wait_ready(registry: &Registry, id: &Uuid) -> u16 {
        let mut status = registry.watch(id).unwrap();
        let ready = status
            .wait_for(|s| matches!(s, TunnelStatus::Ready { .. }))
            .await
            .unwrap();
        match &*ready {
            TunnelStatus::Ready { port } => *port,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn start_inspect_and_stop_a_server_tunnel() {
        let state = test_state();
        let registry = state.registry.clone();
        let (addr, _shutdown) = serve_for_tests(state).await;

        let (status, body) = http(
            addr,
            "POST",
            "/api/server/start",
            Some(r#"{"min_port":10000,"max_port":60000,"bind_addr":"127.0.0.1","control_port":0}"#),
        )
        .await;
        assert_eq!(status, 200);
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        let id: Uuid = v["id"].as_str().unwrap().parse().unwrap();

        wait_ready(&registry, &id).await;
        let (status, body) = http(addr, "GET", &format!("/api/status/{id}"), None).await;
        assert_eq!(status, 200);
        assert!(body.contains(r#""state":"ready""#));

        let (status, body) = http(addr, "POST", &format!("/api/server/{id}/stop"), None).await;
        assert_eq!(status, 200);
        assert!(body.contains(r#""success":true"#));

        let (status, _) = http(addr, "GET", &format!("/api/status/{id}"), None).await;
        assert_eq!(status, 404);
        let (status, _) = http(addr, "POST", &format!("/api/server/{id}/stop"), None).await;
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn missing_fields_are_named_in_the_error() {
        let (addr, _shutdown) = serve_for_tests(test_state()).await;

        let (status, body) = http(
            addr,
            "POST",
            "/api/server/start",
            Some(r#"{"max_port":60000,"bind_addr":"127.0.0.1"}"#),
        )
        .await;
        assert_eq!(status, 400);
        assert!(body.contains("min_port"), "error must name the field: {body}");

        let (status, body) = http(
            addr,
            "POST",
            "/api/client/start",
            Some(r#"{"to":"127.0.0.1","local_host":"localhost","local_port":8080}"#),
        )
        .await;
        assert_eq!(status, 400);
        assert!(
            body.contains("missing field `port`"),
            "error must name the field: {body}"
        );
    }

    #[tokio::test]
    async fn unknown_fields_are_ignored_and_bad_ranges_are_not() {
        let (addr, _shutdown) = serve_for_tests(test_state()).await;

        let (status, _) = http(
            addr,
            "POST",
            "/api/server/start",
            Some(
                r#"{"min_port":10000,"max_port":60000,"bind_addr":"127.0.0.1","control_port":0,"nonsense":true}"#,
            ),
        )
        .await;
        assert_eq!(status, 200);

        let (status, body) = http(
            addr,
            "POST",
            "/api/server/start",
            Some(r#"{"min_port":2,"max_port":1,"bind_addr":"127.0.0.1"}"#),
        )
        .await;
        assert_eq!(status, 400);
        assert!(body.contains("port range"));
    }

    #[tokio::test]
    async fn client_tunnels_run_and_stop_through_the_api() {
        let state = test_state();
        let registry = state.registry.clone();
        let (addr, _shutdown) = serve_for_tests(state).await;

        let (status, body) = http(
            addr,
            "POST",
            "/api/server/start",
            Some(r#"{"min_port":10000,"max_port":60000,"bind_addr":"127.0.0.1","control_port":0}"#),
        )
        .await;
        assert_eq!(status, 200);
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        let server_id: Uuid = v["id"].as_str().unwrap().parse().unwrap();
        let control_port = wait_ready(&registry, &server_id).await;

        let (status, body) = http(
            addr,
            "POST",
            "/api/client/start",
            Some(&format!(
                r#"{{"to":"127.0.0.1","control_port":{control_port},"local_host":"127.0.0.1","local_port":8080,"port":0}}"#
            )),
        )
        .await;
        assert_eq!(status, 200);
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        let client_id: Uuid = v["id"].as_str().unwrap().parse().unwrap();
        wait_ready(&registry, &client_id).await;

        let (status, body) = http(addr, "GET", "/api/tunnels", None).await;
        assert_eq!(status, 200);
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v.as_array().unwrap().len(), 2);

        // Stopping through the wrong endpoint must not touch the tunnel.
        let (status, _) = http(addr, "POST", &format!("/api/server/{client_id}/stop"), None).await;
        assert_eq!(status, 404);
        let (status, _) = http(addr, "POST", &format!("/api/client/{client_id}/stop"), None).await;
        assert_eq!(status, 200);
        let (status, _) = http(addr, "POST", &format!("/api/server/{server_id}/stop"), None).await;
        assert_eq!(status, 200);
    }

    #[tokio::test]
    async fn health_and_metrics_respond() {
        let (addr, _shutdown) = serve_for_tests(test_state()).await;

        let (status, body) = http(addr, "GET", "/health", None).await;
        assert_eq!(status, 200);
        assert!(body.contains(r#""ok":true"#));

        let (status, _) = http(addr, "GET", "/metrics", None).await;
        assert_eq!(status, 200);
    }
}

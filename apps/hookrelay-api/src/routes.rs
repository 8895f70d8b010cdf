use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hookrelay_kernel::{Relay, SIGNATURE_HEADER};
use hookrelay_protocol::{
    ConnectionError, DispatchReport, InboundEvent, SinkError, SinkOutcome, ToolDescriptor,
    ToolInvocationResult, ToolServerStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

const DEFAULT_LIST_LIMIT: usize = 50;

#[derive(Clone)]
struct AppState {
    relay: Relay,
}

/// Both the provider's dotted names and plain names are accepted; the dotted
/// one wins when a query carries both.
#[derive(Debug, Deserialize, Default)]
struct VerificationQuery {
    #[serde(rename = "hub.mode")]
    hub_mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    hub_verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    hub_challenge: Option<String>,
    mode: Option<String>,
    verify_token: Option<String>,
    challenge: Option<String>,
}

impl VerificationQuery {
    fn mode(&self) -> Option<&str> {
        self.hub_mode.as_deref().or(self.mode.as_deref())
    }

    fn verify_token(&self) -> Option<&str> {
        self.hub_verify_token
            .as_deref()
            .or(self.verify_token.as_deref())
    }

    fn challenge(&self) -> Option<&str> {
        self.hub_challenge.as_deref().or(self.challenge.as_deref())
    }
}

#[derive(Debug, Deserialize, Default)]
struct ListQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct EventListResponse {
    events: Vec<InboundEvent>,
    total: usize,
}

#[derive(Debug, Serialize)]
struct DispatchListResponse {
    reports: Vec<DispatchReport>,
    total: usize,
}

#[derive(Debug, Serialize)]
struct ServerListResponse {
    servers: Vec<ToolServerStatus>,
}

#[derive(Debug, Serialize)]
struct ToolListResponse {
    server: String,
    tools: Vec<ToolDescriptor>,
}

#[derive(Debug, Deserialize)]
struct InvokeRequest {
    tool: String,
    #[serde(default = "empty_arguments")]
    arguments: Value,
}

fn empty_arguments() -> Value {
    json!({})
}

#[derive(Debug, Deserialize)]
struct WorkflowSendRequest {
    data: Value,
    #[serde(rename = "workflowId", default)]
    workflow_id: Option<String>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<ConnectionError> for ApiError {
    fn from(error: ConnectionError) -> Self {
        let status = match error {
            ConnectionError::UnknownServer(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_GATEWAY,
        };
        Self {
            status,
            message: error.to_string(),
        }
    }
}

impl From<SinkError> for ApiError {
    fn from(error: SinkError) -> Self {
        let status = match error {
            SinkError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        };
        Self {
            status,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(relay: Relay) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/webhook", get(verify_webhook).post(receive_webhook))
        .route("/events", get(list_events))
        .route("/dispatches", get(list_dispatches))
        .route("/tools/servers", get(list_servers))
        .route("/tools/servers/{name}/connect", post(connect_server))
        .route("/tools/servers/{name}/disconnect", post(disconnect_server))
        .route("/tools/servers/{name}/tools", get(list_tools))
        .route("/tools/servers/{name}/invoke", post(invoke_tool))
        .route("/workflow/send", post(send_to_workflow))
        .with_state(AppState { relay })
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn healthz(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "hookrelay",
        "sinks": state.relay.sink_names(),
        "events": state.relay.events().len(),
        "connected_servers": state.relay.registry().live_connections(),
    }))
}

async fn verify_webhook(
    State(state): State<AppState>,
    Query(query): Query<VerificationQuery>,
) -> Response {
    match state
        .relay
        .ingress()
        .handshake(query.mode(), query.verify_token(), query.challenge())
    {
        Ok(challenge) => (StatusCode::OK, challenge).into_response(),
        Err(_) => StatusCode::FORBIDDEN.into_response(),
    }
}

async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    match state.relay.ingress().accept(body.to_vec(), signature) {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::UNAUTHORIZED,
    }
}

async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<EventListResponse> {
    let history = state.relay.events();
    let events = history
        .query(query.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .iter()
        .map(|event| event.as_ref().clone())
        .collect();
    Json(EventListResponse {
        events,
        total: history.len(),
    })
}

async fn list_dispatches(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<DispatchListResponse> {
    let history = state.relay.dispatches();
    let reports = history
        .query(query.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .iter()
        .map(|report| report.as_ref().clone())
        .collect();
    Json(DispatchListResponse {
        reports,
        total: history.len(),
    })
}

async fn list_servers(State(state): State<AppState>) -> Json<ServerListResponse> {
    Json(ServerListResponse {
        servers: state.relay.registry().statuses(),
    })
}

fn server_status(state: &AppState, name: &str) -> ApiResult<ToolServerStatus> {
    state
        .relay
        .registry()
        .statuses()
        .into_iter()
        .find(|status| status.name.as_str() == name)
        .ok_or_else(|| ApiError::not_found(format!("tool server not registered: {name}")))
}

async fn connect_server(
    Path(name): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<ToolServerStatus>> {
    state.relay.registry().connect(&name).await?;
    Ok(Json(server_status(&state, &name)?))
}

async fn disconnect_server(
    Path(name): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<Value>> {
    let status = server_status(&state, &name)?;
    let disconnected = state.relay.registry().disconnect(&name).await;
    Ok(Json(json!({
        "server": status.name,
        "disconnected": disconnected,
    })))
}

async fn list_tools(
    Path(name): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<ToolListResponse>> {
    let tools = state.relay.registry().list_tools(&name).await?;
    Ok(Json(ToolListResponse {
        server: name,
        tools,
    }))
}

async fn invoke_tool(
    Path(name): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<InvokeRequest>,
) -> ApiResult<Json<ToolInvocationResult>> {
    let result = state
        .relay
        .registry()
        .invoke(&name, &request.tool, request.arguments)
        .await?;
    Ok(Json(result))
}

async fn send_to_workflow(
    State(state): State<AppState>,
    Json(request): Json<WorkflowSendRequest>,
) -> ApiResult<Json<SinkOutcome>> {
    let workflow = state.relay.workflow().ok_or_else(|| ApiError {
        status: StatusCode::SERVICE_UNAVAILABLE,
        message: "no workflow webhook configured".to_owned(),
    })?;
    let outcome = workflow
        .send(request.data, request.workflow_id.as_deref())
        .await?;
    Ok(Json(outcome))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::Result;
    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use hookrelay_kernel::{
        Relay, RelayBuilder, RelayConfig, SIGNATURE_HEADER, WorkflowSettings, sign,
    };
    use hookrelay_protocol::{
        EventKind, MessageEvent, Sink, SinkError, SinkOutcome, ToolServerDescriptor,
    };
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tower::ServiceExt;

    use super::router;

    const SECRET: &str = "app-secret";
    const VERIFY_TOKEN: &str = "verify-me";

    struct RecordingSink {
        name: &'static str,
        seen: Mutex<Vec<MessageEvent>>,
    }

    impl RecordingSink {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Sink for RecordingSink {
        fn name(&self) -> &str {
            self.name
        }

        async fn on_message(&self, event: &MessageEvent) -> Result<SinkOutcome, SinkError> {
            self.seen.lock().push(event.clone());
            Ok(SinkOutcome::delivered("recorded"))
        }
    }

    async fn relay_with(sinks: &[Arc<RecordingSink>]) -> Result<Relay> {
        let config = RelayConfig::new(VERIFY_TOKEN).with_app_secret(SECRET);
        let mut builder = RelayBuilder::new(config);
        for sink in sinks {
            builder = builder.sink(sink.clone());
        }
        builder.build().await
    }

    fn one_message_envelope() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "102290129340398",
                "changes": [{
                    "field": "messages",
                    "value": {
                        "messaging_product": "whatsapp",
                        "messages": [{
                            "from": "27765275317",
                            "id": "wamid.HBgLMjc3NjUyNzUzMTcVAgASGBQzQUI",
                            "timestamp": "1700000000",
                            "type": "text",
                            "text": { "body": "hi" }
                        }]
                    }
                }]
            }]
        }))
        .unwrap()
    }

    fn signed_post(body: Vec<u8>, signature: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Result<Value> {
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    #[tokio::test]
    async fn signed_delivery_reaches_every_sink() -> Result<()> {
        let (first, second) = (RecordingSink::new("first"), RecordingSink::new("second"));
        let relay = relay_with(&[first.clone(), second.clone()]).await?;
        let body = one_message_envelope();
        let signature = sign(&body, SECRET);

        let response = router(relay.clone())
            .oneshot(signed_post(body, &signature))
            .await?;
        assert_eq!(response.status(), StatusCode::OK);

        relay.ingress().drain(Duration::from_secs(5)).await;

        let events = relay.events().query(10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::MessageReceived);

        for sink in [&first, &second] {
            let seen = sink.seen.lock();
            assert_eq!(seen.len(), 1, "sink {}", sink.name);
            assert_eq!(seen[0].from, "27765275317");
            assert_eq!(seen[0].message_type, "text");
            assert_eq!(seen[0].text.as_deref(), Some("hi"));
            assert_eq!(seen[0].raw["text"]["body"], "hi");
        }
        Ok(())
    }

    #[tokio::test]
    async fn bad_signature_is_rejected_without_side_effects() -> Result<()> {
        let sink = RecordingSink::new("only");
        let relay = relay_with(&[sink.clone()]).await?;
        let body = one_message_envelope();
        let signature = sign(&body, "not-the-secret");

        let response = router(relay.clone())
            .oneshot(signed_post(body, &signature))
            .await?;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        relay.ingress().drain(Duration::from_millis(200)).await;
        assert!(sink.seen.lock().is_empty());
        assert!(relay.events().is_empty());

        let response = router(relay.clone())
            .oneshot(Request::builder().uri("/events").body(Body::empty())?)
            .await?;
        let listed = json_body(response).await?;
        assert_eq!(listed["total"], 0);
        Ok(())
    }

    #[tokio::test]
    async fn verification_handshake() -> Result<()> {
        let relay = relay_with(&[]).await?;

        let response = router(relay.clone())
            .oneshot(
                Request::builder()
                    .uri("/webhook?hub.mode=subscribe&hub.verify_token=verify-me&hub.challenge=abc123")
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        assert_eq!(&body[..], b"abc123");

        let response = router(relay.clone())
            .oneshot(
                Request::builder()
                    .uri("/webhook?mode=subscribe&verify_token=verify-me&challenge=plain")
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(response.status(), StatusCode::OK);

        let response = router(relay.clone())
            .oneshot(
                Request::builder()
                    .uri("/webhook?hub.mode=subscribe&mode=other&hub.verify_token=verify-me&hub.challenge=both")
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        assert_eq!(&body[..], b"both");

        let response = router(relay)
            .oneshot(
                Request::builder()
                    .uri("/webhook?hub.mode=subscribe&hub.verify_token=wrong&hub.challenge=abc123")
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        Ok(())
    }

    #[tokio::test]
    async fn events_and_dispatches_are_listed_newest_first() -> Result<()> {
        let sink = RecordingSink::new("only");
        let relay = relay_with(&[sink]).await?;

        for from in ["111", "222", "333"] {
            let body = serde_json::to_vec(&json!({
                "entry": [{ "changes": [{ "field": "messages", "value": {
                    "messages": [{ "from": from, "type": "text", "text": { "body": "hi" } }]
                } }] }]
            }))?;
            let signature = sign(&body, SECRET);
            let response = router(relay.clone())
                .oneshot(signed_post(body, &signature))
                .await?;
            assert_eq!(response.status(), StatusCode::OK);
            relay.ingress().drain(Duration::from_secs(5)).await;
        }

        let response = router(relay.clone())
            .oneshot(Request::builder().uri("/events?limit=2").body(Body::empty())?)
            .await?;
        let listed = json_body(response).await?;
        assert_eq!(listed["total"], 3);
        let events = listed["events"].as_array().cloned().unwrap_or_default();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0]["raw_payload"]["entry"][0]["changes"][0]["value"]["messages"][0]["from"],
            "333"
        );

        let response = router(relay)
            .oneshot(Request::builder().uri("/dispatches").body(Body::empty())?)
            .await?;
        let listed = json_body(response).await?;
        assert_eq!(listed["total"], 3);
        assert_eq!(listed["reports"][0]["calls"][0]["sink"], "only");
        Ok(())
    }

    #[tokio::test]
    async fn unknown_tool_server_is_not_found() -> Result<()> {
        let relay = relay_with(&[]).await?;

        let response = router(relay.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/tools/servers/missing/invoke")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"tool":"echo"}"#))?,
            )
            .await?;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let error = json_body(response).await?;
        assert!(error["error"].as_str().unwrap_or_default().contains("missing"));

        let response = router(relay)
            .oneshot(Request::builder().uri("/tools/servers").body(Body::empty())?)
            .await?;
        let listed = json_body(response).await?;
        assert_eq!(listed["servers"], json!([]));
        Ok(())
    }

    #[tokio::test]
    async fn server_listing_hides_env_values() -> Result<()> {
        let config = RelayConfig::new(VERIFY_TOKEN).with_app_secret(SECRET);
        let relay = RelayBuilder::new(config)
            .tool_server(
                ToolServerDescriptor::new("rest_api", "node")
                    .with_env("HUBSPOT_API_KEY", "pat-na1-secret")
                    .with_env("API_KEY", "another-secret"),
            )
            .build()
            .await?;

        let response = router(relay)
            .oneshot(Request::builder().uri("/tools/servers").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        let text = String::from_utf8_lossy(&bytes);
        assert!(!text.contains("pat-na1-secret"));
        assert!(!text.contains("another-secret"));

        let listed: Value = serde_json::from_slice(&bytes)?;
        assert_eq!(listed["servers"][0]["name"], "rest_api");
        assert_eq!(
            listed["servers"][0]["env_keys"],
            json!(["API_KEY", "HUBSPOT_API_KEY"])
        );
        Ok(())
    }

    /// Accept one HTTP request, answer 200, and hand back its JSON body.
    async fn workflow_endpoint() -> Result<(String, oneshot::Receiver<Value>)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("http://{}/webhook/whatsapp", listener.local_addr()?);
        let (sender, receiver) = oneshot::channel();

        tokio::spawn(async move {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let mut buffer = Vec::new();
            let mut chunk = [0_u8; 4096];
            let body = loop {
                let Ok(read) = stream.read(&mut chunk).await else {
                    return;
                };
                if read == 0 {
                    return;
                }
                buffer.extend_from_slice(&chunk[..read]);
                let text = String::from_utf8_lossy(&buffer).to_string();
                let Some(split) = text.find("\r\n\r\n") else {
                    continue;
                };
                let length = text[..split]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                let body = &buffer[split + 4..];
                if body.len() >= length {
                    break body[..length].to_vec();
                }
            };

            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await;
            let _ = sender.send(serde_json::from_slice(&body).unwrap_or(Value::Null));
        });

        Ok((url, receiver))
    }

    fn workflow_send(body: Value) -> Result<Request<Body>> {
        Ok(Request::builder()
            .method("POST")
            .uri("/workflow/send")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body)?))?)
    }

    #[tokio::test]
    async fn workflow_send_forwards_the_document() -> Result<()> {
        let (url, captured) = workflow_endpoint().await?;
        let mut config = RelayConfig::new(VERIFY_TOKEN).with_app_secret(SECRET);
        config.workflow = Some(WorkflowSettings {
            url,
            token: Some("n8n".to_owned()),
        });
        let relay = RelayBuilder::new(config).build().await?;

        let response = router(relay)
            .oneshot(workflow_send(json!({
                "data": { "type": "crm_data", "data": { "id": "c-1" } },
                "workflowId": "crm-sync"
            }))?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let outcome = json_body(response).await?;
        assert_eq!(outcome["success"], true);

        let forwarded = captured.await?;
        assert_eq!(forwarded["type"], "crm_data");
        assert_eq!(forwarded["data"]["id"], "c-1");
        assert_eq!(forwarded["workflowId"], "crm-sync");
        Ok(())
    }

    #[tokio::test]
    async fn workflow_send_without_workflow_is_unavailable() -> Result<()> {
        let relay = relay_with(&[]).await?;
        let response = router(relay)
            .oneshot(workflow_send(json!({ "data": { "hello": "world" } }))?)
            .await?;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let error = json_body(response).await?;
        assert!(error["error"].as_str().unwrap_or_default().contains("workflow"));
        Ok(())
    }
}

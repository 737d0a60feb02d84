//! WebSocket ↔ HTTP multiplexer.
//!
//! One WebSocket connection carries many concurrent request/response and
//! SSE exchanges. Each incoming frame is an HTTP-shaped request:
//!
//! ```json
//! {"id": "r1", "method": "POST", "path": "/api/execute", "body": {"command": "ls"}}
//! ```
//!
//! The request is dispatched through the real router. A JSON response comes
//! back as one `{"type":"response", id, status, body, done:true}` frame; a
//! `text/event-stream` response is re-framed event by event as
//! `{"type":"stream", id, event, data}` frames followed by a terminal
//! `response` frame. Responses are correlated solely by `id` — the same id
//! may legally be in flight more than once.
//!
//! Malformed frames get an `error` frame carrying the originating `id` when
//! it could be parsed. A failure to write to the socket closes it with 1011.

use std::collections::HashMap;

use axum::body::Body;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::Extension;
use axum::http::{header, HeaderName, HeaderValue, Method, Request};
use axum::response::Response;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use http_body_util::BodyExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::sse::SseParser;

/// Close code sent when the server cannot write to the socket.
const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// The routable API, injected as an extension so the WS layer can dispatch
/// into the same routes HTTP clients hit.
#[derive(Clone)]
pub struct InnerRouter(pub Router);

/// One multiplexed request frame.
#[derive(Debug, Deserialize)]
pub struct WsRequest {
    pub id: Value,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub body: Option<Value>,
}

/// `GET /api/ws` — upgrade to the multiplexed transport.
pub async fn ws_upgrade(
    Extension(router): Extension<InnerRouter>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, router))
}

/// Main socket loop: frames in, responses out. Each request runs on its own
/// task so long streams don't block unrelated requests on the same socket.
async fn handle_ws(socket: WebSocket, router: InnerRouter) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Value>(256);

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(t) => t,
                Err(e) => {
                    error!("ws: failed to serialize frame: {e}");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_INTERNAL_ERROR,
                        reason: "send failure".into(),
                    })))
                    .await;
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                let parsed: Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(_) => {
                        let _ = tx
                            .send(json!({
                                "type": "error",
                                "code": "INVALID_JSON",
                                "message": "failed to parse frame",
                            }))
                            .await;
                        continue;
                    }
                };
                let id = parsed.get("id").cloned();
                let request: WsRequest = match serde_json::from_value(parsed) {
                    Ok(r) => r,
                    Err(e) => {
                        let mut frame = json!({
                            "type": "error",
                            "code": "INVALID_REQUEST",
                            "message": format!("invalid request frame: {e}"),
                        });
                        if let Some(id) = id {
                            frame["id"] = id;
                        }
                        let _ = tx.send(frame).await;
                        continue;
                    }
                };
                tokio::spawn(run_request(router.0.clone(), request, tx.clone()));
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    send_task.abort();
}

/// Dispatch one frame through the router, emitting response frames on `tx`.
async fn run_request(router: Router, request: WsRequest, tx: mpsc::Sender<Value>) {
    for frame in dispatch(router, request).await {
        if tx.send(frame).await.is_err() {
            // Socket gone; the stream body (if any) was dropped with us.
            debug!("ws: connection closed mid-response");
            return;
        }
    }
}

/// Turn one multiplexed request into its ordered list of response frames.
///
/// Separated from the socket loop so the framing logic is testable without
/// a WebSocket.
pub async fn dispatch(router: Router, request: WsRequest) -> Vec<Value> {
    let id = request.id.clone();
    let error_frame = |code: &str, message: String| {
        vec![json!({ "type": "error", "id": id, "code": code, "message": message })]
    };

    let Ok(method) = Method::from_bytes(request.method.as_bytes()) else {
        return error_frame("INVALID_REQUEST", format!("bad method: {}", request.method));
    };
    if !request.path.starts_with('/') {
        return error_frame("INVALID_REQUEST", format!("bad path: {}", request.path));
    }

    let body = match &request.body {
        None => Body::empty(),
        Some(Value::String(s)) => Body::from(s.clone()),
        Some(v) => Body::from(v.to_string()),
    };
    let mut http_request = match Request::builder()
        .method(method)
        .uri(&request.path)
        .body(body)
    {
        Ok(r) => r,
        Err(e) => return error_frame("INVALID_REQUEST", format!("bad request: {e}")),
    };
    if request.body.is_some() {
        http_request.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
    }
    if let Some(headers) = &request.headers {
        for (name, value) in headers {
            let Ok(name) = name.parse::<HeaderName>() else {
                continue;
            };
            let Ok(value) = HeaderValue::from_str(value) else {
                continue;
            };
            http_request.headers_mut().insert(name, value);
        }
    }

    let response = match tower::ServiceExt::oneshot(router, http_request).await {
        Ok(r) => r,
        Err(never) => match never {},
    };
    let status = response.status().as_u16();
    let is_sse = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"));

    let mut frames = Vec::new();
    let mut body = response.into_body();

    if is_sse {
        let mut parser = SseParser::new();
        loop {
            match body.frame().await {
                Some(Ok(frame)) => {
                    if let Some(data) = frame.data_ref() {
                        for event in parser.feed(data) {
                            frames.push(stream_frame(&request.id, event));
                        }
                    }
                }
                Some(Err(e)) => {
                    // Client-side cancellation surfaces here; benign.
                    debug!("ws: sse body error: {e}");
                    break;
                }
                None => break,
            }
        }
        if let Some(event) = parser.finish() {
            frames.push(stream_frame(&request.id, event));
        }
        frames.push(json!({
            "type": "response",
            "id": request.id,
            "status": status,
            "done": true,
        }));
    } else {
        let bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!("ws: body read error: {e}");
                return error_frame("IO_ERROR", format!("failed to read response body: {e}"));
            }
        };
        let body_value = serde_json::from_slice::<Value>(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        frames.push(json!({
            "type": "response",
            "id": request.id,
            "status": status,
            "body": body_value,
            "done": true,
        }));
    }
    frames
}

/// `{type:"stream", id, event, data}` — `data` is parsed JSON when possible.
fn stream_frame(id: &Value, event: crate::sse::SseEvent) -> Value {
    let data = serde_json::from_str::<Value>(&event.data)
        .unwrap_or(Value::String(event.data));
    json!({
        "type": "stream",
        "id": id,
        "event": event.event.unwrap_or_else(|| "message".to_string()),
        "data": data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::sse::{Event, Sse};
    use axum::routing::{get, post};
    use axum::Json;

    fn test_router() -> Router {
        Router::new()
            .route(
                "/api/echo",
                post(|Json(body): Json<Value>| async move { Json(json!({ "echo": body })) }),
            )
            .route(
                "/api/events",
                get(|| async {
                    let events = vec![
                        Event::default().event("start").data(r#"{"n":1}"#),
                        Event::default().event("complete").data(r#"{"n":2}"#),
                    ];
                    Sse::new(futures::stream::iter(
                        events.into_iter().map(Ok::<_, std::convert::Infallible>),
                    ))
                }),
            )
    }

    fn request(id: &str, method: &str, path: &str, body: Option<Value>) -> WsRequest {
        WsRequest {
            id: Value::String(id.to_string()),
            method: method.to_string(),
            path: path.to_string(),
            headers: None,
            body,
        }
    }

    #[tokio::test]
    async fn json_response_is_one_done_frame() {
        let frames = dispatch(
            test_router(),
            request("r1", "POST", "/api/echo", Some(json!({"x": 1}))),
        )
        .await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "response");
        assert_eq!(frames[0]["id"], "r1");
        assert_eq!(frames[0]["status"], 200);
        assert_eq!(frames[0]["done"], true);
        assert_eq!(frames[0]["body"]["echo"]["x"], 1);
    }

    #[tokio::test]
    async fn sse_response_becomes_stream_frames() {
        let frames = dispatch(test_router(), request("r2", "GET", "/api/events", None)).await;
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0]["type"], "stream");
        assert_eq!(frames[0]["event"], "start");
        assert_eq!(frames[0]["data"]["n"], 1);
        assert_eq!(frames[1]["event"], "complete");
        assert_eq!(frames[1]["data"]["n"], 2);
        assert_eq!(frames[2]["type"], "response");
        assert_eq!(frames[2]["done"], true);
        assert_eq!(frames[2]["id"], "r2");
    }

    #[tokio::test]
    async fn unknown_route_reports_status() {
        let frames = dispatch(test_router(), request("r3", "GET", "/nope", None)).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["status"], 404);
    }

    #[tokio::test]
    async fn bad_method_is_error_frame() {
        let frames = dispatch(
            test_router(),
            request("r4", "NOT A METHOD", "/api/echo", None),
        )
        .await;
        assert_eq!(frames[0]["type"], "error");
        assert_eq!(frames[0]["id"], "r4");
    }

    #[tokio::test]
    async fn relative_path_is_rejected() {
        let frames = dispatch(test_router(), request("r5", "GET", "api/echo", None)).await;
        assert_eq!(frames[0]["type"], "error");
    }
}

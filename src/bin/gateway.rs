// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Gateway binary: wires the `rfbgateway` core to an `axum` HTTP+WebSocket
//! router. This is the only place `axum` types appear; the core stays
//! testable without a running server.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use clap::Parser;
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::json;

use rfbgateway::subscriber::{OutboundMessage, SinkError, SubscriberSink};
use rfbgateway::{compression, input::InputSurface, GatewayError, SessionRegistry};

/// RFB gateway: terminates VNC against upstream displays and re-serves
/// views and input over HTTP/WebSocket.
#[derive(Parser, Debug)]
#[command(name = "rfbgateway", version, about)]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0")]
    listen_host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080)]
    listen_port: u16,

    /// Raise logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone)]
struct AppState {
    registry: Arc<SessionRegistry>,
    input: Arc<InputSurface>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let state = AppState {
        registry: Arc::new(SessionRegistry::new()),
        input: Arc::new(InputSurface::new()),
    };

    let app = Router::new()
        .route("/", get(index))
        .route("/vnc/:host/:port", get(viewer_page))
        .route("/ws/:host/:port", get(websocket_upgrade))
        .route("/vnc/:host/:port/api/move", post(action_move))
        .route("/vnc/:host/:port/api/click", post(action_click))
        .route("/vnc/:host/:port/api/type", post(action_type))
        .route("/vnc/:host/:port/api/scroll", post(action_scroll))
        .route("/vnc/:host/:port/api/drag", post(action_drag))
        .route("/vnc/:host/:port/api/shortcut", post(action_shortcut))
        .route("/vnc/:host/:port/api/screenshot", get(action_screenshot))
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", cli.listen_host, cli.listen_port)
        .parse()
        .expect("invalid listen address");
    info!("listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await.expect("failed to bind listener");
    axum::serve(listener, app).await.expect("server error");
}

async fn index() -> Html<&'static str> {
    Html("<html><body><h1>rfbgateway</h1><p>Connect to <code>/vnc/&lt;host&gt;/&lt;port&gt;</code>.</p></body></html>")
}

async fn viewer_page(Path((host, port)): Path<(String, u16)>) -> Html<String> {
    Html(viewer_html(&host, port))
}

fn viewer_html(host: &str, port: u16) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>rfbgateway: {host}:{port}</title></head>
<body>
<canvas id="screen"></canvas>
<script>
const ws = new WebSocket(`ws://${{location.host}}/ws/{host}/{port}`);
const canvas = document.getElementById('screen');
const ctx = canvas.getContext('2d');
ws.onmessage = (event) => {{
  const msg = JSON.parse(event.data);
  if (msg.type === 'connected') {{
    canvas.width = msg.width;
    canvas.height = msg.height;
  }} else if (msg.type === 'frame' || msg.type === 'update') {{
    const img = new Image();
    img.onload = () => ctx.drawImage(img, msg.x, msg.y);
    img.src = 'data:image/jpeg;base64,' + msg.data;
  }}
}};
canvas.addEventListener('mousedown', (event) => {{
  ws.send(JSON.stringify({{type: 'pointer', x: event.offsetX, y: event.offsetY, buttonMask: 1}}));
}});
canvas.addEventListener('mouseup', (event) => {{
  ws.send(JSON.stringify({{type: 'pointer', x: event.offsetX, y: event.offsetY, buttonMask: 0}}));
}});
document.addEventListener('keydown', (event) => {{
  ws.send(JSON.stringify({{type: 'key', key: event.key, down: true}}));
}});
document.addEventListener('keyup', (event) => {{
  ws.send(JSON.stringify({{type: 'key', key: event.key, down: false}}));
}});
</script>
</body>
</html>"#
    )
}

async fn websocket_upgrade(
    Path((host, port)): Path<(String, u16)>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_websocket(socket, host, port, state))
}

struct WebSocketSink {
    outbound: tokio::sync::mpsc::UnboundedSender<OutboundMessage>,
}

#[async_trait::async_trait]
impl SubscriberSink for WebSocketSink {
    async fn send(&self, msg: OutboundMessage) -> Result<(), SinkError> {
        self.outbound.send(msg).map_err(|_| SinkError)
    }
}

async fn handle_websocket(mut socket: WebSocket, host: String, port: u16, state: AppState) {
    let session_and_broadcaster = state.registry.get_or_create(&host, port).await;
    let (session, broadcaster) = match session_and_broadcaster {
        Ok(pair) => pair,
        Err(err) => {
            warn!("failed to connect to {host}:{port}: {err}");
            let _ = socket
                .send(Message::Text(json!({"type": "error", "message": err.to_string()}).to_string()))
                .await;
            return;
        }
    };

    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel();
    broadcaster.attach(Arc::new(WebSocketSink { outbound: outbound_tx.clone() })).await;

    let (width, height) = session.framebuffer.dimensions();
    let connected = OutboundMessage::Connected { width, height };
    if socket.send(Message::Text(to_json(&connected))).await.is_err() {
        state.registry.release(&host, port).await;
        return;
    }

    // A subscriber attaching to an already-drained session would otherwise
    // see a blank canvas until the next dirty tick, so push the current
    // frame immediately.
    send_full_frame(&outbound_tx, &session);

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(msg) => {
                        if socket.send(Message::Text(to_json(&msg))).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound_text(&text, &session, &state.input, &outbound_tx).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        warn!("websocket error for {host}:{port}: {err}");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    state.registry.release(&host, port).await;
}

/// Encodes the framebuffer's current contents at quality 85 and sends an
/// `OutboundMessage::Frame` to the requesting subscriber.
fn send_full_frame(outbound: &tokio::sync::mpsc::UnboundedSender<OutboundMessage>, session: &rfbgateway::RfbSession) {
    let (bbox, pixels) = session.framebuffer.snapshot_full();
    match compression::encode_jpeg(&pixels, bbox.width, bbox.height, 85) {
        Ok(jpeg_bytes) => {
            let data = base64::engine::general_purpose::STANDARD.encode(jpeg_bytes);
            let _ = outbound.send(OutboundMessage::Frame { x: bbox.x, y: bbox.y, data });
        }
        Err(err) => warn!("failed to encode full frame: {err}"),
    }
}

async fn handle_inbound_text(
    text: &str,
    session: &rfbgateway::RfbSession,
    input: &InputSurface,
    outbound: &tokio::sync::mpsc::UnboundedSender<OutboundMessage>,
) {
    use rfbgateway::subscriber::InboundMessage;
    let Ok(message) = serde_json::from_str::<InboundMessage>(text) else {
        warn!("unparseable subscriber message: {text}");
        return;
    };
    let result = match message {
        InboundMessage::Pointer { x, y, button_mask } => {
            input.move_pointer(session, x, y, Some(button_mask)).await
        }
        InboundMessage::Key { key, down } => input.send_named_key(session, &key, down).await,
        InboundMessage::RequestFullFrame => {
            send_full_frame(outbound, session);
            Ok(())
        }
    };
    if let Err(err) = result {
        warn!("failed to handle subscriber message: {err}");
    }
}

fn to_json(msg: &OutboundMessage) -> String {
    serde_json::to_string(msg).unwrap_or_else(|_| r#"{"type":"error","message":"encoding failure"}"#.to_string())
}

#[derive(Deserialize)]
struct MoveBody {
    x: i32,
    y: i32,
}

#[derive(Deserialize)]
struct ClickBody {
    x: i32,
    y: i32,
    #[serde(default = "default_button")]
    button: u8,
}

#[derive(Deserialize)]
struct TypeBody {
    text: String,
    #[serde(default = "default_type_delay")]
    delay: f64,
}

#[derive(Deserialize)]
struct ScrollBody {
    direction: String,
    x: Option<i32>,
    y: Option<i32>,
}

#[derive(Deserialize)]
struct DragBody {
    x_start: i32,
    y_start: i32,
    x_end: i32,
    y_end: i32,
    #[serde(default = "default_button")]
    button: u8,
    #[serde(default = "default_drag_delay")]
    delay: f64,
}

#[derive(Deserialize)]
struct ShortcutBody {
    keys: Vec<String>,
}

fn default_button() -> u8 {
    1
}

fn default_type_delay() -> f64 {
    0.05
}

fn default_drag_delay() -> f64 {
    0.5
}

async fn action_move(
    Path((host, port)): Path<(String, u16)>,
    State(state): State<AppState>,
    Json(body): Json<MoveBody>,
) -> Response {
    let input = state.input.clone();
    with_session(state.registry.clone(), host, port, move |session| async move {
        input.move_pointer(&session, body.x, body.y, None).await
    })
    .await
}

async fn action_click(
    Path((host, port)): Path<(String, u16)>,
    State(state): State<AppState>,
    Json(body): Json<ClickBody>,
) -> Response {
    let input = state.input.clone();
    with_session(state.registry.clone(), host, port, move |session| async move {
        input.click(&session, body.x, body.y, body.button).await
    })
    .await
}

async fn action_type(
    Path((host, port)): Path<(String, u16)>,
    State(state): State<AppState>,
    Json(body): Json<TypeBody>,
) -> Response {
    let input = state.input.clone();
    with_session(state.registry.clone(), host, port, move |session| async move {
        input.type_text(&session, &body.text, body.delay).await
    })
    .await
}

async fn action_scroll(
    Path((host, port)): Path<(String, u16)>,
    State(state): State<AppState>,
    Json(body): Json<ScrollBody>,
) -> Response {
    let input = state.input.clone();
    with_session(state.registry.clone(), host, port, move |session| async move {
        let (width, height) = session.framebuffer.dimensions();
        let x = body.x.unwrap_or(i32::from(width) / 2);
        let y = body.y.unwrap_or(i32::from(height) / 2);
        input.scroll(&session, x, y, body.direction == "down").await
    })
    .await
}

async fn action_drag(
    Path((host, port)): Path<(String, u16)>,
    State(state): State<AppState>,
    Json(body): Json<DragBody>,
) -> Response {
    let input = state.input.clone();
    with_session(state.registry.clone(), host, port, move |session| async move {
        input
            .drag(&session, (body.x_start, body.y_start), (body.x_end, body.y_end), body.button, body.delay)
            .await
    })
    .await
}

async fn action_shortcut(
    Path((host, port)): Path<(String, u16)>,
    State(state): State<AppState>,
    Json(body): Json<ShortcutBody>,
) -> Response {
    let input = state.input.clone();
    with_session(state.registry.clone(), host, port, move |session| async move {
        input.shortcut(&session, &body.keys).await
    })
    .await
}

async fn action_screenshot(Path((host, port)): Path<(String, u16)>, State(state): State<AppState>) -> Response {
    let result = state.registry.get_or_create(&host, port).await;
    match result {
        Ok((session, _broadcaster)) => {
            let (bbox, pixels) = session.framebuffer.snapshot_full();
            state.registry.release(&host, port).await;
            match compression::encode_png(&pixels, bbox.width, bbox.height) {
                Ok(png_bytes) => ([("content-type", "image/png")], png_bytes).into_response(),
                Err(err) => connection_failed_response(&err),
            }
        }
        Err(err) => connection_failed_response(&err),
    }
}

async fn with_session<F, Fut>(registry: Arc<SessionRegistry>, host: String, port: u16, action: F) -> Response
where
    F: FnOnce(Arc<rfbgateway::RfbSession>) -> Fut,
    Fut: std::future::Future<Output = rfbgateway::Result<()>>,
{
    match registry.get_or_create(&host, port).await {
        Ok((session, _broadcaster)) => {
            let outcome = action(session).await;
            registry.release(&host, port).await;
            match outcome {
                Ok(()) => Json(json!({"status": "success"})).into_response(),
                Err(err) => {
                    error!("input action against {host}:{port} failed: {err}");
                    connection_failed_response(&err)
                }
            }
        }
        Err(err) => connection_failed_response(&err),
    }
}

fn connection_failed_response(err: &GatewayError) -> Response {
    (axum::http::StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "VNC connection failed", "detail": err.to_string()})))
        .into_response()
}

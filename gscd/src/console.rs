//! WebSocket console: transcript replay, live output, inbound commands.
//!
//! Wire format, both directions, is small JSON frames: the server pushes
//! `{"raw": <text>}` chunks and the client sends `{"text": <command>}`.
//! On connect a client gets one `raw` frame with the transcript tail, then
//! live chunks with no gap. Dropping the connection drops the broadcast
//! receiver, which is the whole unsubscribe story.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use gsc_common::OpError;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::http::AppState;
use crate::transcript::note_lagged;

#[derive(Serialize)]
struct TermData<'a> {
    raw: &'a str,
}

#[derive(Serialize)]
struct TermError<'a> {
    error: &'a str,
}

#[derive(Deserialize)]
struct TermSendText {
    text: String,
}

pub async fn console_ws(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Static console page shell; everything interesting happens over the
/// websocket.
pub async fn console_page() -> axum::response::Html<&'static str> {
    axum::response::Html(CONSOLE_PAGE)
}

const CONSOLE_PAGE: &str = r##"<!doctype html>
<html>
<head><meta charset="utf-8"><title>Server Console</title>
<style>
  #terminal { white-space: pre-wrap; font-family: monospace; background: #111;
              color: #ddd; height: 70vh; overflow-y: scroll; padding: 8px; }
</style>
</head>
<body>
<p><a href="/fileexplorer?p=.">file explorer</a></p>
<div id="terminal"></div>
<form id="inputForm"><input id="input" autocomplete="off" style="width:80%"></form>
<script>
  const term = document.querySelector("#terminal");
  const sock = new WebSocket(`ws://${location.host}/console/ws`);
  sock.onmessage = (event) => {
    const data = JSON.parse(event.data);
    term.textContent += data.raw !== undefined ? data.raw : `[${data.error}]\n`;
    term.scrollTop = term.scrollHeight;
  };
  const input = document.querySelector("#input");
  document.querySelector("#inputForm").addEventListener("submit", (event) => {
    event.preventDefault();
    const text = input.value.trim();
    if (!text) return;
    sock.send(JSON.stringify({ text }));
    input.value = "";
  });
</script>
</body>
</html>
"##;

fn raw_frame(text: &str) -> Message {
    let payload = serde_json::to_string(&TermData { raw: text })
        .unwrap_or_else(|_| "{\"raw\":\"\"}".to_string());
    Message::Text(Utf8Bytes::from(payload))
}

fn error_frame(text: &str) -> Message {
    let payload = serde_json::to_string(&TermError { error: text })
        .unwrap_or_else(|_| "{\"error\":\"\"}".to_string());
    Message::Text(Utf8Bytes::from(payload))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();

    // Snapshot + subscription are taken atomically, so the replay frame and
    // the first live chunk join without a gap or an overlap.
    let (replay, mut chunks) = state
        .bridge
        .subscribe_with_tail(state.config.console.replay_bytes);
    if sink.send(raw_frame(&replay)).await.is_err() {
        return;
    }
    debug!(replay_bytes = replay.len(), "console client connected");

    loop {
        tokio::select! {
            chunk = chunks.recv() => match chunk {
                Ok(text) => {
                    if sink.send(raw_frame(&text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => note_lagged(skipped),
                Err(RecvError::Closed) => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(payload))) => {
                    if let Err(err) = handle_command(&state, payload.as_str()).await {
                        if sink.send(error_frame(&err.to_string())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(error = %err, "console client socket error");
                    break;
                }
            },
        }
    }
    debug!("console client disconnected");
}

/// Parse one inbound frame and forward the command to the process.
///
/// Whitespace-only input is silently ignored. A non-empty command is first
/// echoed to every connected client (so all observers see who typed what),
/// then written to the child's stdin.
async fn handle_command(state: &AppState, payload: &str) -> Result<(), OpError> {
    let frame: TermSendText = match serde_json::from_str(payload) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(error = %err, "discarding malformed console frame");
            return Ok(());
        }
    };
    let text = frame.text.trim();
    if text.is_empty() {
        return Ok(());
    }

    state.bridge.broadcast_notice(&format!("> {text}\r\n"));
    state.bridge.write(text).await
}

//! WebSocket transport: accepts authoring-side connections, parses message
//! envelopes into engine commands, and broadcasts engine responses.
//!
//! Commands flow over an unbounded channel so the transport preserves the
//! protocol's ordered + lossless delivery contract; the render thread
//! processes them one at a time between frame ticks.

use std::{
    net::TcpListener,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use serde_json::Value;
use tungstenite::{Error as WsError, Message, accept};

use crate::protocol::{EngineCommand, ErrorPayload, WsMessage, now_millis};

/// One parsed command together with the request id to echo in a response.
pub struct InboundCommand {
    pub command: EngineCommand,
    pub request_id: Option<String>,
}

fn spawn_server_ping_loop(hub: WsHub) {
    thread::spawn(move || {
        loop {
            let ping = WsMessage::<Value> {
                msg_type: "ping".to_string(),
                timestamp: now_millis(),
                request_id: None,
                payload: None,
            };

            if let Ok(text) = serde_json::to_string(&ping) {
                hub.broadcast(text);
            }

            thread::sleep(Duration::from_millis(200));
        }
    });
}

#[derive(Clone, Default)]
pub struct WsHub {
    clients: Arc<Mutex<Vec<Sender<String>>>>,
}

impl WsHub {
    pub fn broadcast(&self, text: String) {
        let Ok(mut clients) = self.clients.lock() else {
            return;
        };
        clients.retain(|tx| tx.send(text.clone()).is_ok());
    }

    pub fn broadcast_message(&self, message: &WsMessage<Value>) {
        if let Ok(text) = serde_json::to_string(message) {
            self.broadcast(text);
        }
    }

    fn register_client(&self, tx: Sender<String>) {
        if let Ok(mut clients) = self.clients.lock() {
            clients.push(tx);
        }
    }
}

pub fn spawn_ws_server(
    addr: &str,
    command_tx: Sender<InboundCommand>,
    hub: WsHub,
) -> Result<thread::JoinHandle<()>> {
    let addr_str = addr.to_string();
    let server =
        TcpListener::bind(addr).with_context(|| format!("failed to bind ws server at {addr}"))?;

    // Editor-side heartbeat: server periodically emits {type:"ping"}.
    // (Client may reply with {type:"pong"}, which we accept as a no-op.)
    spawn_server_ping_loop(hub.clone());

    Ok(thread::spawn(move || {
        if let Err(e) = run_ws_server(server, &addr_str, command_tx, hub) {
            log::error!("[ws] server failed: {e:?}");
        }
    }))
}

fn run_ws_server(
    server: TcpListener,
    addr: &str,
    command_tx: Sender<InboundCommand>,
    hub: WsHub,
) -> Result<()> {
    log::info!("[ws] listening on ws://{addr}");

    for stream in server.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                log::warn!("[ws] accept tcp failed: {e}");
                continue;
            }
        };

        let command_tx = command_tx.clone();
        let hub = hub.clone();

        thread::spawn(move || {
            if let Err(e) = handle_client(stream, command_tx, hub) {
                log::info!("[ws] client ended: {e:?}");
            }
        });
    }

    Ok(())
}

fn handle_client(
    stream: std::net::TcpStream,
    command_tx: Sender<InboundCommand>,
    hub: WsHub,
) -> Result<()> {
    // Handshake is easier with a blocking socket, switch to non-blocking afterwards.
    let mut ws = accept(stream).context("websocket handshake failed")?;
    ws.get_mut()
        .set_nonblocking(true)
        .context("failed to set tcp non-blocking")?;

    let (client_tx, client_rx) = crossbeam_channel::unbounded::<String>();
    hub.register_client(client_tx);

    loop {
        // 1) flush outbound (responses, errors, pings)
        while let Ok(text) = client_rx.try_recv() {
            let _ = ws.send(Message::Text(text));
        }

        // 2) read inbound
        match ws.read() {
            Ok(Message::Text(text)) => {
                if let Err(e) = handle_text_message(&mut ws, &text, &command_tx) {
                    log::warn!("[ws] handle message error: {e:?}");
                }
            }
            Ok(Message::Binary(_)) => {
                // ignore
            }
            Ok(Message::Ping(payload)) => {
                let _ = ws.send(Message::Pong(payload));
            }
            Ok(Message::Pong(_)) => {}
            Ok(Message::Frame(_)) => {}
            Ok(Message::Close(_)) => break,
            Err(WsError::Io(ref io)) if io.kind() == std::io::ErrorKind::WouldBlock => {
                // nothing to read
            }
            Err(WsError::AlreadyClosed) | Err(WsError::ConnectionClosed) => break,
            Err(e) => return Err(e).context("websocket read failed"),
        }

        thread::sleep(Duration::from_millis(5));
    }

    Ok(())
}

fn handle_text_message(
    ws: &mut tungstenite::WebSocket<std::net::TcpStream>,
    text: &str,
    command_tx: &Sender<InboundCommand>,
) -> Result<()> {
    let msg: WsMessage<Value> = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            send_error(ws, None, "PARSE_ERROR", &format!("invalid json: {e}"));
            return Ok(());
        }
    };

    match msg.msg_type.as_str() {
        "ping" => {
            let pong = WsMessage::<Value> {
                msg_type: "pong".to_string(),
                timestamp: now_millis(),
                request_id: msg.request_id,
                payload: None,
            };
            let _ = ws.send(Message::Text(serde_json::to_string(&pong)?));
        }
        "pong" => {
            // No-op: clients may auto-reply to server-initiated pings.
        }
        msg_type => match EngineCommand::parse(msg_type, msg.payload) {
            Ok(command) => {
                // Unbounded: every accepted command reaches the engine, in
                // order. A full parse failure never disturbs the loop.
                let _ = command_tx.send(InboundCommand {
                    command,
                    request_id: msg.request_id,
                });
            }
            Err(e) => {
                send_error(ws, msg.request_id, "PARSE_ERROR", &format!("{e:#}"));
            }
        },
    }

    Ok(())
}

fn send_error(
    ws: &mut tungstenite::WebSocket<std::net::TcpStream>,
    request_id: Option<String>,
    code: &str,
    message: &str,
) {
    let err = WsMessage {
        msg_type: "error".to_string(),
        timestamp: now_millis(),
        request_id,
        payload: Some(ErrorPayload {
            code: code.to_string(),
            message: message.to_string(),
        }),
    };

    if let Ok(text) = serde_json::to_string(&err) {
        let _ = ws.send(Message::Text(text));
    }
}

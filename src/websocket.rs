//! # Duplex WebSocket Transport
//!
//! The per-connection loop of the voice relay. Clients connect to `/ws`,
//! send text frames carrying JSON control messages and binary frames carrying
//! raw float32 PCM; the server answers on the same connection with binary
//! PCM frames (a zero-length frame means "no output yet for this input").
//!
//! ## Ordering and Concurrency:
//! Each connection gets a dedicated worker task fed through an in-order
//! channel, so message handling within one connection is strictly sequential
//! even though inference runs on the blocking thread pool. Connections never
//! share session state, and a slow inference on one connection cannot stall
//! another's receive loop.
//!
//! ## Failure Containment:
//! Per-message failures degrade to empty responses inside the session; only
//! transport-level failures (disconnect, protocol error, a dead worker) end
//! the connection, and then only that connection.

use crate::audio::session::{Session, SessionRegistry};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Interval between server-initiated pings.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Peers silent for longer than this are considered gone.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Control messages a client may send as text frames.
///
/// Anything that does not parse into this enum (unknown `type`, missing
/// fields, invalid JSON) is logged and dropped without acknowledgment; a bad
/// control message must never cost the client its connection.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Select the persona text prompt and voice for this session
    Config { persona: String, voice: String },
}

/// Commands forwarded to the session worker, in arrival order.
enum SessionCommand {
    Configure { persona: String, voice: String },
    Audio(web::Bytes),
}

/// Response audio pushed back from the worker to the socket.
#[derive(Message)]
#[rtype(result = "()")]
struct OutboundAudio(Vec<u8>);

/// WebSocket actor owning one connection's lifetime.
pub struct DuplexWebSocket {
    session_id: String,
    /// Session handed to the worker when the connection starts
    session: Option<Session>,
    registry: Arc<SessionRegistry>,
    commands: Option<mpsc::UnboundedSender<SessionCommand>>,
    last_heartbeat: Instant,
}

impl DuplexWebSocket {
    pub fn new(session: Session, registry: Arc<SessionRegistry>) -> Self {
        Self {
            session_id: session.session_id().to_string(),
            session: Some(session),
            registry,
            commands: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn forward(&mut self, command: SessionCommand, ctx: &mut ws::WebsocketContext<Self>) {
        let alive = self
            .commands
            .as_ref()
            .map(|tx| tx.send(command).is_ok())
            .unwrap_or(false);

        if !alive {
            // The worker is gone; the session cannot make progress anymore
            error!("Session {} worker unavailable, closing", self.session_id);
            ctx.stop();
        }
    }
}

impl Actor for DuplexWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Session {} connected", self.session_id);

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("Session {} heartbeat timeout, closing", act.session_id);
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });

        let (tx, rx) = mpsc::unbounded_channel();
        self.commands = Some(tx);

        let session = self
            .session
            .take()
            .expect("session is present until the connection starts");
        tokio::spawn(run_session_worker(
            session,
            rx,
            ctx.address(),
            Arc::clone(&self.registry),
        ));
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Dropping the sender ends the worker loop, which closes the session
        // and removes it from the registry
        self.commands = None;
        info!("Session {} disconnected", self.session_id);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for DuplexWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                match serde_json::from_str::<ControlMessage>(&text) {
                    Ok(ControlMessage::Config { persona, voice }) => {
                        self.forward(SessionCommand::Configure { persona, voice }, ctx);
                    }
                    Err(e) => {
                        warn!(
                            "Session {} ignoring malformed control message: {}",
                            self.session_id, e
                        );
                    }
                }
            }
            Ok(ws::Message::Binary(data)) => {
                debug!(
                    "Session {} received {} bytes of audio",
                    self.session_id,
                    data.len()
                );
                self.forward(SessionCommand::Audio(data), ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("Session {} closed by client: {:?}", self.session_id, reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Session {} sent unexpected continuation frame", self.session_id);
            }
            Ok(ws::Message::Nop) => {}
            Err(e) => {
                error!("Session {} protocol error: {}", self.session_id, e);
                ctx.stop();
            }
        }
    }
}

impl Handler<OutboundAudio> for DuplexWebSocket {
    type Result = ();

    fn handle(&mut self, msg: OutboundAudio, ctx: &mut Self::Context) {
        // Zero-length frames are valid: "no output yet produced"
        ctx.binary(msg.0);
    }
}

/// Per-connection worker: drains commands in order, runs inference on the
/// blocking pool, and pushes response audio back to the socket.
async fn run_session_worker(
    session: Session,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    addr: Addr<DuplexWebSocket>,
    registry: Arc<SessionRegistry>,
) {
    let session_id = session.session_id().to_string();
    let mut slot = Some(session);

    while let Some(command) = commands.recv().await {
        match command {
            SessionCommand::Configure { persona, voice } => {
                if let Some(session) = slot.as_mut() {
                    session.on_config(&persona, &voice);
                }
            }
            SessionCommand::Audio(data) => {
                let Some(mut session) = slot.take() else { break };

                // Inference is CPU/accelerator-bound; keep it off the async
                // workers so other connections stay responsive
                let handled = tokio::task::spawn_blocking(move || {
                    let response = session.on_audio(&data);
                    (session, response)
                })
                .await;

                match handled {
                    Ok((session, response)) => {
                        slot = Some(session);
                        addr.do_send(OutboundAudio(response));
                    }
                    Err(e) => {
                        error!("Session {} worker task failed: {}", session_id, e);
                        break;
                    }
                }
            }
        }
    }

    if let Some(mut session) = slot {
        session.close();
    }
    registry.remove(&session_id);
}

/// WebSocket endpoint handler: upgrades the HTTP request and wires a fresh
/// session into the connection actor.
pub async fn duplex_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(
        "New WebSocket connection request from {:?}",
        req.connection_info().peer_addr()
    );

    let registry = app_state.session_registry();
    let info = match registry.register() {
        Ok(info) => info,
        Err(e) => {
            warn!("Connection rejected: {}", e);
            return Ok(HttpResponse::ServiceUnavailable().json(serde_json::json!({
                "error": { "type": "session_limit", "message": e.to_string() }
            })));
        }
    };

    let runtime = app_state.engine();
    let engine = match runtime.create_engine() {
        Ok(engine) => engine,
        Err(e) => {
            registry.remove(&info.session_id);
            error!("Failed to create session engine: {:#}", e);
            return Ok(HttpResponse::InternalServerError().json(serde_json::json!({
                "error": { "type": "engine_error", "message": e.to_string() }
            })));
        }
    };

    let session = Session::new(info, runtime.frame_size(), engine);
    let websocket = DuplexWebSocket::new(session, registry);
    ws::start(websocket, &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_message_parses() {
        let json = r#"{"type": "config", "persona": "a calm narrator", "voice": "NATF0"}"#;
        let msg: ControlMessage = serde_json::from_str(json).unwrap();
        let ControlMessage::Config { persona, voice } = msg;
        assert_eq!(persona, "a calm narrator");
        assert_eq!(voice, "NATF0");
    }

    #[test]
    fn test_unknown_message_type_is_rejected() {
        let json = r#"{"type": "shutdown", "persona": "x", "voice": "y"}"#;
        assert!(serde_json::from_str::<ControlMessage>(json).is_err());
    }

    #[test]
    fn test_missing_fields_are_rejected() {
        let json = r#"{"type": "config", "persona": "only persona"}"#;
        assert!(serde_json::from_str::<ControlMessage>(json).is_err());

        assert!(serde_json::from_str::<ControlMessage>("not json at all").is_err());
    }
}

//! # Conversation WebSocket Handler
//!
//! Bridges a client websocket to the conversation orchestrator.
//! Clients connect to `/ws/conversation?counterpartId=...&token=...` (the
//! credential may instead come as an `Authorization: Bearer` header).
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: upgrade is refused with 400 without `counterpartId`
//!    and with 503 when the server is at conversation capacity
//! 2. **Setup**: the orchestrator authenticates and opens the model session;
//!    on failure the client gets an `error` event and a close
//! 3. **Ready**: `{"type":"connection-ready","connectionId":...}`
//! 4. **Conversation**: binary PCM both ways, JSON events both ways
//! 5. **Close**: either side; the orchestrator tears the session down
//!
//! ## Message Format:
//! - **Client → Server**: binary PCM (16-bit, 16kHz, mono), `start-audio-turn`, `heartbeat`
//! - **Server → Client**: binary PCM agent speech, conversation events
//!
//! ## Actor Model:
//! Each socket is an actix actor. It owns no conversation state: inbound
//! traffic is forwarded over a channel to the connection's orchestrator task,
//! and everything the orchestrator emits arrives back as a second stream on
//! the actor.

use crate::conversation::{ClientEvent, ClientInbound, ClientOutbound, ConnectRequest, ServerEvent};
use crate::error::AppError;
use crate::state::{AppState, ConversationEnd, ConversationSlot};

use actix::prelude::*;
use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

/// How often heartbeat pings are sent to the client
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long without any client traffic before the socket is considered dead
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Upgrade query parameters.
#[derive(Debug, Deserialize)]
pub struct ConversationQuery {
    #[serde(rename = "counterpartId")]
    pub counterpart_id: Option<String>,
    pub token: Option<String>,
}

/// WebSocket actor for one conversation.
pub struct ConversationSocket {
    /// Forwarding side of the orchestrator's input; dropping it ends the conversation
    inbound: Option<mpsc::UnboundedSender<ClientInbound>>,

    /// Handed to the orchestrator task when the actor starts
    pending: Option<PendingConversation>,

    state: web::Data<AppState>,

    last_heartbeat: Instant,
}

struct PendingConversation {
    /// Capacity held until the orchestrator returns
    slot: ConversationSlot,
    request: ConnectRequest,
    inbound: mpsc::UnboundedReceiver<ClientInbound>,
    outbound_tx: mpsc::UnboundedSender<ClientOutbound>,
    outbound_rx: mpsc::UnboundedReceiver<ClientOutbound>,
}

impl ConversationSocket {
    pub fn new(request: ConnectRequest, slot: ConversationSlot, state: web::Data<AppState>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        Self {
            inbound: Some(inbound_tx),
            pending: Some(PendingConversation {
                slot,
                request,
                inbound: inbound_rx,
                outbound_tx,
                outbound_rx,
            }),
            state,
            last_heartbeat: Instant::now(),
        }
    }

    fn forward(&mut self, message: ClientInbound, ctx: &mut ws::WebsocketContext<Self>) {
        let delivered = self
            .inbound
            .as_ref()
            .map_or(false, |inbound| inbound.send(message).is_ok());
        if !delivered {
            debug!("Conversation already finished, closing socket");
            ctx.stop();
        }
    }

    fn send_event(&self, ctx: &mut ws::WebsocketContext<Self>, event: &ServerEvent) {
        match serde_json::to_string(event) {
            Ok(json) => ctx.text(json),
            Err(err) => error!("Failed to encode server event: {}", err),
        }
    }
}

impl Actor for ConversationSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Conversation socket started");

        if let Some(PendingConversation {
            slot,
            request,
            inbound,
            outbound_tx,
            outbound_rx,
        }) = self.pending.take()
        {
            ctx.add_stream(UnboundedReceiverStream::new(outbound_rx));

            let orchestrator = self.state.orchestrator.clone();
            let state = self.state.clone();
            state.record_conversation_started();
            tokio::spawn(async move {
                let end = match orchestrator.run(request, inbound, outbound_tx).await
                {
                    Ok(connection_id) => {
                        info!(connection_id = %connection_id, "Conversation finished");
                        ConversationEnd::Completed
                    }
                    Err(err) => {
                        info!("Conversation ended during setup: {}", err);
                        ConversationEnd::Failed
                    }
                };
                state.record_conversation_ended(end);
                drop(slot);
            });
        }

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Orchestrator sees the closed channel and tears the session down
        self.inbound.take();
        info!("Conversation socket stopped");
    }
}

/// Frames from the client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ConversationSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.forward(ClientInbound::Audio(data), ctx);
            }
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => self.forward(ClientInbound::Event(event), ctx),
                    Err(err) => {
                        warn!("Invalid client event: {}", err);
                        self.send_event(ctx, &ServerEvent::error(format!("invalid event: {}", err)));
                    }
                }
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("Client closed websocket: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Output from the orchestrator.
impl StreamHandler<ClientOutbound> for ConversationSocket {
    fn handle(&mut self, msg: ClientOutbound, ctx: &mut Self::Context) {
        match msg {
            ClientOutbound::Audio(chunk) => ctx.binary(chunk),
            ClientOutbound::Event(event) => self.send_event(ctx, &event),
            ClientOutbound::Close => {
                ctx.close(Some(ws::CloseCode::Normal.into()));
                ctx.stop();
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        debug!("Conversation output stream finished");
        ctx.stop();
    }
}

/// Pull the bearer credential from the query or the Authorization header.
fn extract_credential(req: &HttpRequest, query: &ConversationQuery) -> Option<String> {
    query
        .token
        .clone()
        .filter(|t| !t.trim().is_empty())
        .or_else(|| {
            req.headers()
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.trim().to_string())
        })
}

/// WebSocket endpoint handler.
///
/// Rejections that can be decided without a session (bad request, capacity)
/// are plain HTTP responses; everything else is reported over the socket.
pub async fn conversation_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("New conversation request from: {:?}", req.connection_info().peer_addr());

    let query = web::Query::<ConversationQuery>::from_query(req.query_string())
        .map_err(|e| AppError::InvalidArgument(format!("invalid query: {}", e)))?
        .into_inner();

    let Some(counterpart_id) = query.counterpart_id.clone().filter(|id| !id.trim().is_empty()) else {
        state.record_conversation_rejected();
        return Err(AppError::InvalidArgument("counterpartId is required".to_string()).into());
    };

    let Some(slot) = state.try_reserve_conversation() else {
        state.record_conversation_rejected();
        warn!(
            reserved = state.reserved_conversations(),
            "Refusing conversation, server at capacity"
        );
        return Ok(HttpResponse::ServiceUnavailable().json(json!({
            "error": {
                "type": "at_capacity",
                "message": "Too many active conversations, try again later",
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        })));
    };

    let request = ConnectRequest {
        credential: extract_credential(&req, &query),
        counterpart_id,
    };

    ws::start(ConversationSocket::new(request, slot, state), &req, stream)
}

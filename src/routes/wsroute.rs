use actix::{Actor, ActorContext, AsyncContext, Handler, Message as ActixMessage, StreamHandler};
use actix_web::{get, web, Error, HttpRequest, HttpResponse, ResponseError};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::unbounded_channel;
use tracing::{info, warn};

use crate::state::AppState;
use crate::websocket::handlers::handle_event;
use crate::websocket::message_types::{WsInboundEvent, WsOutboundEvent};
use crate::websocket::{ConnectionId, SessionCommand};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

// Router-originated payload forwarded to the client.
#[derive(ActixMessage)]
#[rtype(result = "()")]
struct Outbound(String);

// Final payload before the server drops the socket.
#[derive(ActixMessage)]
#[rtype(result = "()")]
struct ForceClose(String);

// WebSocket actor: one per accepted socket.
struct WsSession {
    connection_id: ConnectionId,
    state: AppState,
    hb: Instant,
}

impl WsSession {
    fn new(connection_id: ConnectionId, state: AppState) -> Self {
        Self {
            connection_id,
            state,
            hb: Instant::now(),
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                warn!(connection_id = %act.connection_id, "heartbeat failed, disconnecting");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn dispatch(&self, evt: WsInboundEvent, ctx: &mut ws::WebsocketContext<Self>) {
        let manager = self.state.manager.clone();
        let security = self.state.security.clone();
        let id = self.connection_id;
        let addr = ctx.address();
        actix::spawn(async move {
            let reply = handle_event(&manager, &security, id, evt).await;
            addr.do_send(Outbound(reply.to_json()));
        });
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(connection_id = %self.connection_id, "websocket session started");
        self.hb(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(connection_id = %self.connection_id, "websocket session stopped");
        let manager = self.state.manager.clone();
        let id = self.connection_id;
        actix::spawn(async move {
            manager.on_close(id).await;
        });
    }
}

impl Handler<Outbound> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl Handler<ForceClose> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: ForceClose, ctx: &mut Self::Context) {
        ctx.text(msg.0);
        ctx.stop();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<WsInboundEvent>(&text) {
                Ok(evt) => self.dispatch(evt, ctx),
                Err(e) => {
                    warn!(connection_id = %self.connection_id, error = %e, "unparseable event");
                    let reply = WsOutboundEvent::Error {
                        message: "unrecognized event".to_string(),
                        request_id: None,
                    };
                    ctx.text(reply.to_json());
                }
            },
            Ok(ws::Message::Binary(_)) => {
                warn!(connection_id = %self.connection_id, "binary frames not supported");
            }
            Ok(ws::Message::Close(reason)) => {
                info!(connection_id = %self.connection_id, ?reason, "close frame received");
                ctx.stop();
            }
            _ => {}
        }
    }
}

#[get("/ws")]
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let connection_id = ConnectionId::new();
    let (tx, mut rx) = unbounded_channel::<SessionCommand>();

    if let Err(e) = state.manager.on_open(connection_id, tx).await {
        warn!(connection_id = %connection_id, error = %e, "rejecting connection");
        return Ok(e.error_response());
    }

    let session = WsSession::new(connection_id, state.as_ref().clone());
    let (addr, resp) = ws::WsResponseBuilder::new(session, &req, stream).start_with_addr()?;

    // Bridge the registry's command channel into the actor. The task ends
    // when the registry drops the sender or the actor goes away.
    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                SessionCommand::Deliver(payload) => addr.do_send(Outbound(payload)),
                SessionCommand::Close(payload) => addr.do_send(ForceClose(payload)),
            }
        }
    });

    Ok(resp)
}

/// WebSocket Endpoint (C8, §4.8).
///
/// On connect: accept, assign a fresh `websocket_id`, write the connection
/// record to the durable Connection Registry (C3), and register the live
/// sender with the in-process Connection Manager. On disconnect: the
/// reverse. This is the first real use of the `actix-web-actors` dependency
/// the teacher's Cargo.toml declares but never wires up (see DESIGN.md).
use crate::connections::{ConnectionManager, SharedConnectionRegistry};
use crate::models::{Connection, DeviceType};
use crate::websocket::WebSocketMessage;
use actix::prelude::*;
use actix_web_actors::ws;
use chrono::Utc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(45);

pub struct NotificationSocket {
    user_id: String,
    websocket_id: String,
    last_heartbeat: Instant,
    registry: SharedConnectionRegistry,
    manager: ConnectionManager,
    receiver: Option<mpsc::UnboundedReceiver<WebSocketMessage>>,
}

impl NotificationSocket {
    pub fn new(user_id: String, registry: SharedConnectionRegistry, manager: ConnectionManager) -> Self {
        NotificationSocket {
            user_id,
            websocket_id: Uuid::new_v4().to_string(),
            last_heartbeat: Instant::now(),
            registry,
            manager,
            receiver: None,
        }
    }

    fn heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(user_id = %act.user_id, "websocket heartbeat timeout, closing");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    /// Drains messages pushed by the Delivery Worker (via the
    /// ConnectionManager) onto the socket. Spawned once per actor start.
    fn pump_outbound(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        if let Some(mut receiver) = self.receiver.take() {
            ctx.spawn(actix::fut::wrap_future(async move {
                receiver.recv().await
            }).map(|result, act: &mut Self, ctx| {
                if let Some(message) = result {
                    if let Ok(json) = message.to_json() {
                        ctx.text(json);
                    }
                    act.pump_outbound(ctx);
                }
            }));
        }
    }
}

impl Actor for NotificationSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.heartbeat(ctx);

        let (tx, rx) = mpsc::unbounded_channel();
        self.receiver = Some(rx);

        let connection_url = format!("ws://local/{}", self.websocket_id);
        let connection = Connection {
            user_id: self.user_id.clone(),
            device_type: DeviceType::Web,
            websocket_id: Some(self.websocket_id.clone()),
            connection_url: Some(connection_url),
            device_token: None,
            created_at: Utc::now(),
        };

        let registry = self.registry.clone();
        let manager = self.manager.clone();
        let user_id = self.user_id.clone();
        let websocket_id = self.websocket_id.clone();
        ctx.spawn(actix::fut::wrap_future(async move {
            manager.subscribe(&user_id, websocket_id, tx).await;
            if let Err(e) = registry.store(connection).await {
                warn!(user_id = %user_id, error = %e, "failed to persist websocket connection record");
            }
        }));

        info!(user_id = %self.user_id, websocket_id = %self.websocket_id, "websocket connected");
        self.pump_outbound(ctx);
    }

    fn stopped(&mut self, ctx: &mut Self::Context) {
        let registry = self.registry.clone();
        let manager = self.manager.clone();
        let user_id = self.user_id.clone();
        let websocket_id = self.websocket_id.clone();
        ctx.spawn(actix::fut::wrap_future(async move {
            manager.unsubscribe(&user_id, &websocket_id).await;
            if let Err(e) = registry.delete(&user_id, DeviceType::Web).await {
                warn!(user_id = %user_id, error = %e, "failed to remove websocket connection record");
            }
        }));
        info!(user_id = %self.user_id, websocket_id = %self.websocket_id, "websocket disconnected");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for NotificationSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                if let Ok(WebSocketMessage::Ping { timestamp }) = WebSocketMessage::from_json(&text) {
                    ctx.text(
                        WebSocketMessage::pong(timestamp)
                            .to_json()
                            .unwrap_or_default(),
                    );
                }
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Binary(_)) => {}
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(e) => {
                warn!(user_id = %self.user_id, error = %e, "websocket protocol error");
                ctx.stop();
            }
        }
    }
}

/// HTTP-level acceptor for `WS /ws/{user_id}` (§4.8, §6). Upgrades the
/// connection and hands it to the `NotificationSocket` actor, which owns
/// the connect/disconnect lifecycle against the Connection Registry and
/// Manager.
use crate::connections::{ConnectionManager, SharedConnectionRegistry};
use crate::websocket::NotificationSocket;
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;

pub async fn ws_connect(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    registry: web::Data<SharedConnectionRegistry>,
    manager: web::Data<ConnectionManager>,
) -> Result<HttpResponse, Error> {
    let user_id = path.into_inner();
    let socket = NotificationSocket::new(user_id, registry.get_ref().clone(), manager.get_ref().clone());
    ws::start(socket, &req, stream)
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/ws/{user_id}", web::get().to(ws_connect));
}

/// Ingress HTTP surface (§6, explicitly a collaborator rather than core —
/// "the core requires only that an upstream fan-out delivers events onto
/// `event_queue`"). Kept minimal: publishing and read-back endpoints, in
/// the `ApiResponse<T>` wrapper shape the teacher's `handlers/notifications.rs`
/// uses, so the binary is runnable end-to-end without a separate ingress
/// service.
use crate::bus::{queues, MessageBus};
use crate::fanout::publish_events;
use crate::models::EventWirePayload;
use crate::store::SharedEventStore;
use actix_web::{web, HttpResponse, Result as ActixResult};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        ApiResponse {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: String) -> Self {
        ApiResponse {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PublishResult {
    pub accepted: usize,
}

/// `POST /publish_events` (§6): accepts a batch of event payloads and
/// fans them out onto `event_queue` without waiting for delivery (§4.4).
pub async fn publish_events_handler(
    bus: web::Data<Arc<dyn MessageBus>>,
    payloads: web::Json<Vec<EventWirePayload>>,
) -> ActixResult<HttpResponse> {
    match publish_events(bus.get_ref(), queues::EVENT_QUEUE, &payloads).await {
        Ok(accepted) => Ok(HttpResponse::Ok().json(ApiResponse::ok(PublishResult { accepted }))),
        Err(e) => Ok(HttpResponse::InternalServerError().json(ApiResponse::<()>::err(e.to_string()))),
    }
}

#[derive(Debug, serde::Deserialize)]
pub struct ScanQuery {
    pub filter_key: String,
    pub filter_value: String,
}

/// `GET /events?filter_key&filter_value` (§6): best-effort scan by a
/// single attribute, per `EventStore::scan` (§4.2).
pub async fn list_events_handler(
    store: web::Data<SharedEventStore>,
    query: web::Query<ScanQuery>,
) -> ActixResult<HttpResponse> {
    match store.scan(&query.filter_key, &query.filter_value).await {
        Ok(events) => Ok(HttpResponse::Ok().json(ApiResponse::ok(events))),
        Err(e) => Ok(HttpResponse::BadRequest().json(ApiResponse::<()>::err(e.to_string()))),
    }
}

/// `GET /events/{event_id}` (§6).
pub async fn get_event_handler(
    store: web::Data<SharedEventStore>,
    path: web::Path<String>,
) -> ActixResult<HttpResponse> {
    let event_id = path.into_inner();
    match store.get(&event_id).await {
        Ok(Some(event)) => Ok(HttpResponse::Ok().json(ApiResponse::ok(event))),
        Ok(None) => Ok(HttpResponse::NotFound().json(ApiResponse::<()>::err(format!(
            "no event with id {event_id}"
        )))),
        Err(e) => Ok(HttpResponse::InternalServerError().json(ApiResponse::<()>::err(e.to_string()))),
    }
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/publish_events", web::post().to(publish_events_handler))
        .route("/events", web::get().to(list_events_handler))
        .route("/events/{event_id}", web::get().to(get_event_handler));
}

mod actor;
mod messages;
pub mod routes;

pub use actor::NotificationSocket;
pub use messages::WebSocketMessage;

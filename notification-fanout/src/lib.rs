pub mod bus;
pub mod config;
pub mod connections;
pub mod delivery;
pub mod dispatcher;
pub mod error;
pub mod fanout;
pub mod http;
pub mod ingress;
pub mod metrics;
pub mod models;
pub mod preferences;
pub mod priority;
pub mod store;
pub mod transports;
pub mod websocket;

pub use config::Config;
pub use error::{Error, Result};

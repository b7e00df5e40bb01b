mod config;
mod core_config;
mod proxy;
mod server;

pub(crate) use config::validate_http_url;
pub use config::{AppConfig, AppSettings, LocalProtocol, SubscriptionRecord};
pub use core_config::*;
pub use proxy::*;
pub use server::*;

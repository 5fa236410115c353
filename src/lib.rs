pub mod auth;
pub mod config;
pub mod config_validation;
pub mod error;
pub mod establish;
pub mod http1;
pub mod http2;
pub mod logging;
pub mod request;
pub mod server;
pub mod splice;
pub mod tls;
pub mod upstream;

pub use auth::AuthGate;
pub use config::GatewayConfig;
pub use error::TunnelError;
pub use request::{IncomingRequest, RequestNormalizer, TunnelRequest};
pub use server::Gateway;
pub use upstream::{TransportConnector, UpstreamConnector};

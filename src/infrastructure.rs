//! Infrastructure layer: configuration, logging, persistence and HTTP plumbing

pub mod cache_store;
pub mod config;
pub mod credentials;
pub mod http_transport;
pub mod local_store;
pub mod logging;
pub mod request_gateway;
pub mod single_flight;

pub use cache_store::CacheStore;
pub use config::EngineConfig;
pub use credentials::{CredentialStore, SessionEvent};
pub use http_transport::{HttpTransport, ReqwestTransport};
pub use local_store::LocalStore;
pub use request_gateway::{ApiRequest, RequestGateway};

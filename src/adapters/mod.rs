//! Adapter implementations of the ports.
pub mod http_client;

pub use http_client::HttpClientAdapter;

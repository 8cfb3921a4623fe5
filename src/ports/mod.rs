//! Port (trait) definitions separating the core from I/O implementations.
pub mod http_client;

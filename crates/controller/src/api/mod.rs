//! HTTP API serving the agent directory.

pub mod errors;
pub mod handlers;
pub mod server;

pub use server::ApiServer;

use error_stack::Report;
use poem::get;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Route;
use poem::Server;
use tokio::sync::oneshot;
use tracing::error;
use tracing::info;

use super::errors::ApiError;
use super::handlers::get_agent;
use super::handlers::list_agents;
use super::handlers::readiness;
use super::handlers::SharedDiscovery;

/// HTTP API server exposing discovered agents
pub struct ApiServer {
    discovery: SharedDiscovery,
    listen_addr: String,
}

pub fn routes(discovery: SharedDiscovery) -> impl Endpoint {
    Route::new()
        .at("/readiness", get(readiness))
        .at("/agents", get(list_agents))
        .at("/agent/:name", get(get_agent))
        .data(discovery)
        .with(Tracing)
}

impl ApiServer {
    pub fn new(discovery: SharedDiscovery, listen_addr: String) -> Self {
        Self {
            discovery,
            listen_addr,
        }
    }

    /// Start the API server
    ///
    /// # Errors
    ///
    /// - [`ApiError::ServerError`] if the server fails to start or bind to the address
    pub async fn run(self, mut shutdown_rx: oneshot::Receiver<()>) -> Result<(), Report<ApiError>> {
        info!("Starting HTTP API server on {}", self.listen_addr);

        let app = routes(self.discovery);
        let listener = TcpListener::bind(&self.listen_addr);
        let server = Server::new(listener);

        tokio::select! {
            result = server.run(app) => {
                match result {
                    Ok(()) => {
                        info!("API server stopped normally");
                        Ok(())
                    }
                    Err(e) => {
                        error!("API server failed: {e}");
                        Err(Report::new(ApiError::ServerError {
                            message: format!("Server failed: {e}"),
                        }))
                    }
                }
            }
            _ = &mut shutdown_rx => {
                info!("API server shutdown requested");
                Ok(())
            }
        }
    }
}

use std::sync::Arc;

use discovery::Agent;
use discovery::Discovery;
use poem::handler;
use poem::http::StatusCode;
use poem::web::Data;
use poem::web::Json;
use poem::web::Path;
use tracing::debug;
use tracing::error;

pub type SharedDiscovery = Arc<dyn Discovery>;

#[handler]
pub fn readiness() -> StatusCode {
    StatusCode::OK
}

/// Current snapshot of the agent directory
#[handler]
pub async fn list_agents(discovery: Data<&SharedDiscovery>) -> Json<Vec<Agent>> {
    Json(discovery.agents().await)
}

/// Real-time lookup of one agent, bypassing the cache
#[handler]
pub async fn get_agent(
    Path(name): Path<String>,
    discovery: Data<&SharedDiscovery>,
) -> poem::Result<Json<Agent>> {
    match discovery.agent(&name).await {
        Ok(Some(agent)) => Ok(Json(agent)),
        Ok(None) => {
            debug!(agent = %name, "agent not found");
            Err(poem::Error::from_status(StatusCode::NOT_FOUND))
        }
        Err(report) => {
            error!(agent = %name, "agent lookup failed: {report:?}");
            Err(poem::Error::from_string(
                format!("failed to look up agent {name}"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ))
        }
    }
}

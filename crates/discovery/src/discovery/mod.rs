//! Agent discovery.
//!
//! Two implementations share the [`Discovery`] contract:
//! [`KubernetesDiscovery`] keeps a watch-driven cache of the cluster, and
//! [`ServiceDiscovery`] asks a controller running the former over HTTP.

mod kubernetes;
mod service;
mod types;

use async_trait::async_trait;
use error_stack::Report;

pub use kubernetes::KubernetesDiscovery;
pub use service::ServiceDiscovery;
pub use types::Agent;
pub use types::DiscoveryConfig;
pub use types::DiscoveryError;
pub use types::DEFAULT_APP_LABEL;
pub use types::DEFAULT_COMPONENT_LABEL;
pub use types::DEFAULT_FAILURE_DOMAIN_LABEL;
pub use types::DEFAULT_NAMESPACE;
pub use types::UNKNOWN_ZONE;

#[async_trait]
pub trait Discovery: Send + Sync {
    async fn start(&self) -> Result<(), Report<DiscoveryError>>;

    async fn stop(&self);

    /// The currently known agents. Never touches the network for the
    /// Kubernetes cache; the result may already be stale.
    async fn agents(&self) -> Vec<Agent>;

    /// Looks one agent up with the freshest data available.
    async fn agent(&self, name: &str) -> Result<Option<Agent>, Report<DiscoveryError>>;
}

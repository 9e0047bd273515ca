//! Connectivity-monitor discovery core.
//!
//! [`k8s`] keeps long-lived watches on cluster resources alive across
//! disconnects and stale resource versions; [`discovery`] turns node and pod
//! events into a directory of probing agents.

pub mod discovery;
pub mod k8s;

pub use discovery::Agent;
pub use discovery::Discovery;
pub use discovery::DiscoveryConfig;
pub use discovery::DiscoveryError;
pub use discovery::KubernetesDiscovery;
pub use discovery::ServiceDiscovery;

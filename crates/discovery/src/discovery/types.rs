use core::error::Error;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::k8s::multiplexer::DEFAULT_INIT_TIMEOUT;

pub const DEFAULT_NAMESPACE: &str = "kconmon";
pub const DEFAULT_FAILURE_DOMAIN_LABEL: &str = "failure-domain.beta.kubernetes.io/zone";
pub const DEFAULT_APP_LABEL: &str = "kconmon";
pub const DEFAULT_COMPONENT_LABEL: &str = "agent";

/// Zone reported for agents on nodes without a failure domain label.
pub const UNKNOWN_ZONE: &str = "unknown";

/// A probing agent other agents can reach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    /// Pod name.
    pub name: String,
    pub node_name: String,
    pub ip: String,
    pub zone: String,
}

/// Where agents live and how they are labelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    pub namespace: String,
    /// Node label holding the node's zone.
    pub failure_domain_label: String,
    /// Value of the `app` label on agent pods.
    pub app_label: String,
    /// Value of the `component` label on agent pods.
    pub component_label: String,
    /// How long a second `start` waits for an in-flight API initialisation.
    pub init_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            failure_domain_label: DEFAULT_FAILURE_DOMAIN_LABEL.to_string(),
            app_label: DEFAULT_APP_LABEL.to_string(),
            component_label: DEFAULT_COMPONENT_LABEL.to_string(),
            init_timeout: DEFAULT_INIT_TIMEOUT,
        }
    }
}

impl DiscoveryConfig {
    /// Label selector matching every agent pod.
    pub fn agent_selector(&self) -> String {
        format!("app={},component={}", self.app_label, self.component_label)
    }

    /// In-cluster address of the controller service.
    pub fn controller_url(&self) -> String {
        format!("http://controller.{}.svc.cluster.local", self.namespace)
    }
}

#[derive(Debug, derive_more::Display)]
pub enum DiscoveryError {
    #[display("Kubernetes operation failed")]
    Kubernetes,
    #[display("Controller request failed: {message}")]
    Controller { message: String },
}

impl Error for DiscoveryError {}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn agent_serializes_camel_case() {
        let agent = Agent {
            name: "kconmon-g88mt".to_string(),
            node_name: "n1".to_string(),
            ip: "1.2.3.4".to_string(),
            zone: "europe-west4-a".to_string(),
        };

        assert_eq!(
            serde_json::to_value(&agent).expect("agent serializes"),
            json!({
                "name": "kconmon-g88mt",
                "nodeName": "n1",
                "ip": "1.2.3.4",
                "zone": "europe-west4-a"
            })
        );
    }

    #[test]
    fn default_config_targets_kconmon_agents() {
        let config = DiscoveryConfig::default();

        assert_eq!(config.agent_selector(), "app=kconmon,component=agent");
        assert_eq!(
            config.controller_url(),
            "http://controller.kconmon.svc.cluster.local"
        );
    }
}

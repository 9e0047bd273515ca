use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use discovery::discovery::DEFAULT_APP_LABEL;
use discovery::discovery::DEFAULT_COMPONENT_LABEL;
use discovery::discovery::DEFAULT_FAILURE_DOMAIN_LABEL;
use discovery::discovery::DEFAULT_NAMESPACE;
use discovery::DiscoveryConfig;

/// Where agents run and how to reach the cluster.
#[derive(Args, Clone, Debug)]
pub struct DiscoveryArgs {
    #[arg(
        long,
        env = "DEPLOYMENT_NAMESPACE",
        default_value = DEFAULT_NAMESPACE,
        help = "Namespace the agents are deployed in"
    )]
    pub namespace: String,

    #[arg(
        long,
        env = "FAILURE_DOMAIN_LABEL",
        default_value = DEFAULT_FAILURE_DOMAIN_LABEL,
        help = "Node label holding the node's zone"
    )]
    pub failure_domain_label: String,

    #[arg(
        long,
        env = "APP_LABEL",
        default_value = DEFAULT_APP_LABEL,
        help = "Value of the `app` label on agent pods"
    )]
    pub app_label: String,

    #[arg(
        long,
        env = "COMPONENT_LABEL",
        default_value = DEFAULT_COMPONENT_LABEL,
        help = "Value of the `component` label on agent pods"
    )]
    pub component_label: String,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "INIT_TIMEOUT_SECS",
        default_value = "5",
        help = "Seconds a concurrent start waits for API initialisation"
    )]
    pub init_timeout_secs: u64,
}

impl From<&DiscoveryArgs> for DiscoveryConfig {
    fn from(args: &DiscoveryArgs) -> Self {
        Self {
            namespace: args.namespace.clone(),
            failure_domain_label: args.failure_domain_label.clone(),
            app_label: args.app_label.clone(),
            component_label: args.component_label.clone(),
            init_timeout: Duration::from_secs(args.init_timeout_secs),
        }
    }
}

#[derive(Args, Clone, Debug)]
pub struct ServeArgs {
    #[command(flatten)]
    pub discovery: DiscoveryArgs,

    #[arg(
        long,
        env = "LISTEN_ADDR",
        default_value = "0.0.0.0:8080",
        help = "HTTP API server listen address"
    )]
    pub listen_addr: String,
}

#[derive(Args, Clone, Debug)]
pub struct AgentArgs {
    #[command(flatten)]
    pub discovery: DiscoveryArgs,

    /// Pod name of the agent
    pub name: String,
}

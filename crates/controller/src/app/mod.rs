pub mod tasks;

use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use discovery::k8s::init_kube_client;
use discovery::k8s::ApiRegistry;
use discovery::k8s::KubeResourceClient;
use discovery::Discovery;
use discovery::DiscoveryConfig;
use discovery::KubernetesDiscovery;
use tracing::info;

use crate::app::tasks::Tasks;
use crate::config::AgentArgs;
use crate::config::DiscoveryArgs;
use crate::config::ServeArgs;

async fn build_discovery(args: &DiscoveryArgs) -> Result<Arc<KubernetesDiscovery>> {
    let client = init_kube_client(args.kubeconfig.clone())
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;
    let resources = Arc::new(KubeResourceClient::new(client, ApiRegistry::builtin()));
    let config = DiscoveryConfig::from(args);
    info!(
        namespace = %config.namespace,
        failure_domain_label = %config.failure_domain_label,
        selector = %config.agent_selector(),
        "discovery configured"
    );
    Ok(Arc::new(KubernetesDiscovery::new(resources, config)))
}

/// Runs the controller until a shutdown signal or a fatal watch error.
pub async fn serve(args: ServeArgs) -> Result<()> {
    let discovery = build_discovery(&args.discovery).await?;
    discovery
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))
        .context("failed to start discovery")?;

    let mut tasks = Tasks::new();
    tasks.spawn_api_server(discovery.clone(), args.listen_addr.clone());

    let fatal = {
        let discovery = discovery.clone();
        async move { discovery.fatal_error().await }
    };
    let outcome = tasks.wait_for_completion(fatal).await;
    discovery.stop().await;
    outcome
}

/// Lists agents once, without starting any watch.
pub async fn list_agents(args: DiscoveryArgs) -> Result<()> {
    let discovery = build_discovery(&args).await?;
    discovery
        .reconcile_nodes()
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;
    discovery
        .reconcile_agents()
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;

    let agents = discovery.agents().await;
    println!("{}", serde_json::to_string_pretty(&agents)?);
    Ok(())
}

/// Looks one agent up and prints it.
pub async fn show_agent(args: AgentArgs) -> Result<()> {
    let discovery = build_discovery(&args.discovery).await?;
    discovery
        .reconcile_nodes()
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;

    let agent = discovery
        .agent(&args.name)
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))?
        .with_context(|| format!("agent {} not found", args.name))?;
    println!("{}", serde_json::to_string_pretty(&agent)?);
    Ok(())
}

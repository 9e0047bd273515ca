use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::types::Agent;
use super::types::DiscoveryConfig;
use super::types::DiscoveryError;
use super::types::UNKNOWN_ZONE;
use super::Discovery;
use crate::k8s::decode;
use crate::k8s::EventSelection;
use crate::k8s::EventType;
use crate::k8s::KubernetesError;
use crate::k8s::ResourceClient;
use crate::k8s::ResourceIdentity;
use crate::k8s::WatchMultiplexer;
use crate::k8s::WatcherSettings;

type NodeLabels = BTreeMap<String, String>;

/// Agent directory kept current by watching nodes and agent pods.
pub struct KubernetesDiscovery {
    client: Arc<dyn ResourceClient>,
    multiplexer: WatchMultiplexer,
    cache: Arc<DiscoveryCache>,
    started: AtomicBool,
    watches_registered: AtomicBool,
}

impl KubernetesDiscovery {
    pub fn new(client: Arc<dyn ResourceClient>, config: DiscoveryConfig) -> Self {
        let multiplexer = WatchMultiplexer::with_settings(
            client.clone(),
            WatcherSettings::default(),
            config.init_timeout,
        );
        Self {
            client,
            multiplexer,
            cache: Arc::new(DiscoveryCache::new(config)),
            started: AtomicBool::new(false),
            watches_registered: AtomicBool::new(false),
        }
    }

    fn config(&self) -> &DiscoveryConfig {
        &self.cache.config
    }

    /// Loads every node's labels from a fresh list.
    pub async fn reconcile_nodes(&self) -> Result<(), Report<DiscoveryError>> {
        info!("reconciling nodes from kubernetes");
        let nodes: Vec<Node> = self.select(ResourceIdentity::of::<Node>(), None).await?;
        let count = nodes.len();
        self.cache.seed_nodes(nodes);
        info!(nodes = count, "nodes loaded");
        Ok(())
    }

    /// Re-applies every agent pod from a fresh list and forgets agents whose
    /// pods no longer exist.
    pub async fn reconcile_agents(&self) -> Result<(), Report<DiscoveryError>> {
        info!("reconciling pods from kubernetes");
        let identity = ResourceIdentity::of::<Pod>().in_namespace(&self.config().namespace);
        let selector = self.config().agent_selector();
        let pods: Vec<Pod> = self.select(identity, Some(&selector)).await?;
        self.cache.reconcile_agents(&pods);
        info!(agents = self.cache.agent_count(), "agents discovered");
        Ok(())
    }

    async fn select<K>(
        &self,
        identity: ResourceIdentity,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>, Report<DiscoveryError>>
    where
        K: k8s_openapi::Resource + DeserializeOwned,
    {
        let objects = self
            .client
            .select(&identity, label_selector)
            .await
            .change_context(DiscoveryError::Kubernetes)
            .attach_printable_lazy(|| format!("listing {identity}"))?;
        Ok(objects.into_iter().filter_map(decode_or_skip::<K>).collect())
    }

    /// Queues the node and pod watches. Runs once per instance.
    fn register_watches(&self) -> Result<(), Report<DiscoveryError>> {
        if self.watches_registered.load(Ordering::Acquire) {
            return Ok(());
        }

        let cache = self.cache.clone();
        self.multiplexer
            .watch::<Node, _>(None, EventSelection::All, move |event_type, node| {
                cache.on_node_event(event_type, node)
            })
            .change_context(DiscoveryError::Kubernetes)?;

        let cache = self.cache.clone();
        self.multiplexer
            .watch::<Pod, _>(
                Some(self.config().namespace.as_str()),
                EventSelection::All,
                move |event_type, pod| cache.on_pod_event(event_type, pod),
            )
            .change_context(DiscoveryError::Kubernetes)?;

        self.watches_registered.store(true, Ordering::Release);
        Ok(())
    }

    async fn start_watching(&self) -> Result<(), Report<DiscoveryError>> {
        self.register_watches()?;
        self.reconcile_nodes().await?;
        self.multiplexer
            .start()
            .await
            .change_context(DiscoveryError::Kubernetes)?;
        self.reconcile_agents().await
    }

    /// Resolves when a watch has been unable to reconnect for too long.
    pub async fn fatal_error(&self) -> Option<Report<KubernetesError>> {
        self.multiplexer.fatal_error().await
    }

    pub fn active_streams(&self) -> usize {
        self.multiplexer.active_streams()
    }
}

fn decode_or_skip<K>(object: Value) -> Option<K>
where
    K: k8s_openapi::Resource + DeserializeOwned,
{
    match decode::<K>(object) {
        Ok(resource) => Some(resource),
        Err(report) => {
            warn!("skipping undecodable {}: {report:?}", K::KIND);
            None
        }
    }
}

#[async_trait]
impl Discovery for KubernetesDiscovery {
    /// Seeds the caches and starts the node and pod watches.
    ///
    /// Nodes are listed before pods are watched so agents on existing nodes
    /// resolve their zone right away. The final pod list prunes agents that
    /// disappeared before the watches went live. A failed start may be retried.
    async fn start(&self) -> Result<(), Report<DiscoveryError>> {
        if self.started.swap(true, Ordering::AcqRel) {
            debug!("discovery already started");
            return Ok(());
        }

        let result = self.start_watching().await;
        if result.is_err() {
            self.started.store(false, Ordering::Release);
        }
        result
    }

    async fn stop(&self) {
        self.multiplexer.stop();
    }

    async fn agents(&self) -> Vec<Agent> {
        self.cache.agents()
    }

    async fn agent(&self, name: &str) -> Result<Option<Agent>, Report<DiscoveryError>> {
        let identity = ResourceIdentity::of::<Pod>().in_namespace(&self.config().namespace);
        let Some(object) = self
            .client
            .get(&identity, name)
            .await
            .change_context(DiscoveryError::Kubernetes)
            .attach_printable_lazy(|| format!("looking up agent {name}"))?
        else {
            return Ok(None);
        };
        let pod: Pod = decode(object).change_context(DiscoveryError::Kubernetes)?;
        Ok(self.cache.to_agent(&pod))
    }
}

/// Node labels and agents, mutated only by watch events and reconciliation.
struct DiscoveryCache {
    config: DiscoveryConfig,
    nodes: RwLock<HashMap<String, NodeLabels>>,
    agents: RwLock<BTreeMap<String, Agent>>,
}

impl DiscoveryCache {
    fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            nodes: RwLock::new(HashMap::new()),
            agents: RwLock::new(BTreeMap::new()),
        }
    }

    fn agents(&self) -> Vec<Agent> {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn agent_count(&self) -> usize {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn on_node_event(&self, event_type: EventType, node: Node) {
        let Some(name) = node.metadata.name else {
            return;
        };
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        match event_type {
            EventType::Deleted => {
                info!(node = %name, "node was removed");
                nodes.remove(&name);
            }
            EventType::Added | EventType::Modified => {
                if event_type == EventType::Added {
                    info!(node = %name, "node was added");
                }
                nodes.insert(name, node.metadata.labels.unwrap_or_default());
            }
        }
    }

    fn seed_nodes(&self, list: Vec<Node>) {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        for node in list {
            if let Some(name) = node.metadata.name {
                nodes.insert(name, node.metadata.labels.unwrap_or_default());
            }
        }
    }

    fn on_pod_event(&self, event_type: EventType, pod: Pod) {
        if !self.is_agent_pod(&pod) {
            return;
        }
        match event_type {
            EventType::Deleted => {
                let Some(name) = pod.metadata.name.as_deref() else {
                    return;
                };
                let removed = self
                    .agents
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(name);
                if let Some(agent) = removed {
                    info!(agent = %agent.name, ip = %agent.ip, zone = %agent.zone, "agent removed");
                }
            }
            EventType::Added | EventType::Modified => self.apply_pod(&pod),
        }
    }

    fn is_agent_pod(&self, pod: &Pod) -> bool {
        pod.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get("component"))
            .is_some_and(|component| *component == self.config.component_label)
    }

    /// Caches a running agent the first time it is seen and forgets it once
    /// it stops being running and ready.
    fn apply_pod(&self, pod: &Pod) {
        let Some(name) = pod.metadata.name.as_deref() else {
            return;
        };
        if !is_running_and_ready(pod) {
            let removed = self
                .agents
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(name);
            if removed.is_some() {
                info!(agent = %name, "agent is no longer ready");
            }
            return;
        }

        let Some(agent) = self.to_agent(pod) else {
            return;
        };
        let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);
        if !agents.contains_key(name) {
            info!(agent = %agent.name, node = %agent.node_name, ip = %agent.ip, zone = %agent.zone, "agent added");
            agents.insert(name.to_string(), agent);
        }
    }

    fn reconcile_agents(&self, pods: &[Pod]) {
        for pod in pods {
            self.apply_pod(pod);
        }
        let present: HashSet<&str> = pods
            .iter()
            .filter_map(|pod| pod.metadata.name.as_deref())
            .collect();
        self.agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|name, agent| {
                let keep = present.contains(name.as_str());
                if !keep {
                    info!(agent = %name, ip = %agent.ip, "pruning agent without a pod");
                }
                keep
            });
    }

    /// Builds the agent record for a pod, or `None` while its node is not
    /// known yet.
    fn to_agent(&self, pod: &Pod) -> Option<Agent> {
        let name = pod.metadata.name.clone()?;
        let node_name = pod.spec.as_ref()?.node_name.clone()?;
        let ip = pod.status.as_ref()?.pod_ip.clone()?;

        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        let labels = nodes.get(&node_name)?;
        let zone = match labels.get(&self.config.failure_domain_label) {
            Some(zone) => zone.clone(),
            None => {
                warn!(
                    node = %node_name,
                    label = %self.config.failure_domain_label,
                    "unable to find failure domain label on node"
                );
                UNKNOWN_ZONE.to_string()
            }
        };

        Some(Agent {
            name,
            node_name,
            ip,
            zone,
        })
    }
}

fn is_running_and_ready(pod: &Pod) -> bool {
    let Some(status) = &pod.status else {
        return false;
    };
    status.phase.as_deref() == Some("Running")
        && status
            .container_statuses
            .as_ref()
            .and_then(|statuses| statuses.first())
            .is_some_and(|container| container.ready)
}

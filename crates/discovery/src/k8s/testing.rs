//! Scripted in-memory cluster used by the unit tests.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use error_stack::Report;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ContainerStatus;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::api::core::v1::PodStatus;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde_json::json;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::k8s::client::PatchKind;
use crate::k8s::client::ResourceClient;
use crate::k8s::client::StreamError;
use crate::k8s::client::StreamFrame;
use crate::k8s::client::StreamOptions;
use crate::k8s::client::WatchStream;
use crate::k8s::registry::ApiRegistry;
use crate::k8s::types::KubernetesError;
use crate::k8s::types::ResourceIdentity;

/// What the next `open_stream` call for a kind returns.
pub(crate) enum Script {
    /// Yields the frames, then ends the stream.
    Frames(Vec<StreamFrame>),
    /// Yields the frames, then stays silent forever.
    FramesThenHang(Vec<StreamFrame>),
    /// Stays silent for the requested watch timeout, then reports a read timeout.
    Silent,
    /// Fails to connect with the given status code.
    Fail(u16),
    /// Yields frames as they are fed in; ends once the sender is dropped.
    Feed(mpsc::UnboundedReceiver<StreamFrame>),
}

/// A recorded `open_stream` call.
#[derive(Debug, Clone)]
pub(crate) struct OpenCall {
    pub(crate) identity: ResourceIdentity,
    pub(crate) options: StreamOptions,
    pub(crate) at: Instant,
}

pub(crate) struct FakeClient {
    registry: ApiRegistry,
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    /// Script used once a kind's queue is exhausted; `None` hangs.
    fallback: Mutex<Option<u16>>,
    opens: Mutex<Vec<OpenCall>>,
    opened: Notify,
    objects: Mutex<HashMap<String, Vec<Value>>>,
    patches: Mutex<Vec<(ResourceIdentity, String, PatchKind)>>,
    select_failure: Mutex<Option<u16>>,
    init_calls: AtomicUsize,
    init_delay: Duration,
}

impl FakeClient {
    pub(crate) fn new() -> Self {
        Self::with_init_delay(Duration::ZERO)
    }

    pub(crate) fn with_init_delay(init_delay: Duration) -> Self {
        Self {
            registry: ApiRegistry::builtin(),
            scripts: Mutex::new(HashMap::new()),
            fallback: Mutex::new(None),
            opens: Mutex::new(Vec::new()),
            opened: Notify::new(),
            objects: Mutex::new(HashMap::new()),
            patches: Mutex::new(Vec::new()),
            select_failure: Mutex::new(None),
            init_calls: AtomicUsize::new(0),
            init_delay,
        }
    }

    pub(crate) fn script(&self, kind: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .entry(kind.to_string())
            .or_default()
            .push_back(script);
    }

    /// Scripts the next stream for `kind` to yield whatever is sent here.
    pub(crate) fn feed(&self, kind: &str) -> mpsc::UnboundedSender<StreamFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.script(kind, Script::Feed(rx));
        tx
    }

    /// Makes every unscripted connect attempt fail.
    pub(crate) fn fail_all_connects(&self, status_code: u16) {
        *self.fallback.lock().unwrap() = Some(status_code);
    }

    pub(crate) fn fail_selects(&self, status_code: u16) {
        *self.select_failure.lock().unwrap() = Some(status_code);
    }

    pub(crate) fn restore_selects(&self) {
        *self.select_failure.lock().unwrap() = None;
    }

    pub(crate) fn put(&self, kind: &str, object: Value) {
        let mut objects = self.objects.lock().unwrap();
        let items = objects.entry(kind.to_string()).or_default();
        let name = object_name(&object);
        items.retain(|existing| object_name(existing) != name);
        items.push(object);
    }

    pub(crate) fn opens(&self) -> Vec<OpenCall> {
        self.opens.lock().unwrap().clone()
    }

    pub(crate) fn opens_for(&self, kind: &str) -> Vec<OpenCall> {
        self.opens()
            .into_iter()
            .filter(|call| call.identity.kind == kind)
            .collect()
    }

    pub(crate) fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn patches(&self) -> Vec<(ResourceIdentity, String, PatchKind)> {
        self.patches.lock().unwrap().clone()
    }

    /// Waits until at least `count` streams have been requested in total.
    pub(crate) async fn wait_for_opens(&self, count: usize) -> Vec<OpenCall> {
        let wait = async {
            loop {
                let notified = self.opened.notified();
                if self.opens.lock().unwrap().len() >= count {
                    return self.opens();
                }
                notified.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(3600), wait)
            .await
            .unwrap_or_else(|_| panic!("expected {count} stream opens"))
    }
}

fn object_name(object: &Value) -> Option<String> {
    object
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn object_namespace(object: &Value) -> Option<&str> {
    object.pointer("/metadata/namespace").and_then(Value::as_str)
}

fn matches_selector(object: &Value, selector: Option<&str>) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    selector
        .split(',')
        .filter_map(|term| term.split_once('='))
        .all(|(key, value)| {
            object
                .pointer("/metadata/labels")
                .and_then(|labels| labels.get(key))
                .and_then(Value::as_str)
                == Some(value)
        })
}

fn api_failure(status_code: u16) -> Report<KubernetesError> {
    Report::new(KubernetesError::Api {
        status_code,
        message: "scripted failure".to_string(),
    })
}

#[async_trait]
impl ResourceClient for FakeClient {
    fn registry(&self) -> &ApiRegistry {
        &self.registry
    }

    async fn init(&self) -> Result<(), Report<KubernetesError>> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        if !self.init_delay.is_zero() {
            tokio::time::sleep(self.init_delay).await;
        }
        Ok(())
    }

    async fn get(
        &self,
        identity: &ResourceIdentity,
        name: &str,
    ) -> Result<Option<Value>, Report<KubernetesError>> {
        self.registry.lookup(identity)?;
        let objects = self.objects.lock().unwrap();
        Ok(objects.get(&identity.kind).and_then(|items| {
            items
                .iter()
                .find(|object| {
                    object_name(object).as_deref() == Some(name)
                        && (identity.namespace.is_none()
                            || object_namespace(object) == identity.namespace.as_deref())
                })
                .cloned()
        }))
    }

    async fn select(
        &self,
        identity: &ResourceIdentity,
        label_selector: Option<&str>,
    ) -> Result<Vec<Value>, Report<KubernetesError>> {
        self.registry.lookup(identity)?;
        if let Some(status_code) = *self.select_failure.lock().unwrap() {
            return Err(api_failure(status_code));
        }
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .get(&identity.kind)
            .map(|items| {
                items
                    .iter()
                    .filter(|object| {
                        identity.namespace.is_none()
                            || object_namespace(object) == identity.namespace.as_deref()
                    })
                    .filter(|object| matches_selector(object, label_selector))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn open_stream(
        &self,
        identity: &ResourceIdentity,
        options: &StreamOptions,
    ) -> Result<WatchStream, Report<KubernetesError>> {
        self.registry.lookup(identity)?;
        self.opens.lock().unwrap().push(OpenCall {
            identity: identity.clone(),
            options: options.clone(),
            at: Instant::now(),
        });
        self.opened.notify_waiters();

        let script = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&identity.kind)
            .and_then(VecDeque::pop_front);
        match script {
            Some(Script::Frames(frames)) => Ok(futures::stream::iter(frames).boxed()),
            Some(Script::FramesThenHang(frames)) => Ok(futures::stream::iter(frames)
                .chain(futures::stream::pending())
                .boxed()),
            Some(Script::Silent) => {
                let timeout = options.timeout;
                Ok(futures::stream::once(async move {
                    tokio::time::sleep(timeout).await;
                    StreamFrame::Error(StreamError::ReadTimeout(timeout))
                })
                .boxed())
            }
            Some(Script::Fail(status_code)) => Err(api_failure(status_code)),
            Some(Script::Feed(rx)) => Ok(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|frame| (frame, rx))
            })
            .boxed()),
            None => match *self.fallback.lock().unwrap() {
                Some(status_code) => Err(api_failure(status_code)),
                None => Ok(futures::stream::pending().boxed()),
            },
        }
    }

    async fn patch(
        &self,
        identity: &ResourceIdentity,
        name: &str,
        patch: PatchKind,
    ) -> Result<(), Report<KubernetesError>> {
        self.registry.lookup(identity)?;
        self.patches
            .lock()
            .unwrap()
            .push((identity.clone(), name.to_string(), patch));
        Ok(())
    }
}

/// A watch frame as the API server would send it.
pub(crate) fn frame(event_type: &str, object: Value) -> StreamFrame {
    StreamFrame::Data(json!({ "type": event_type, "object": object }))
}

/// The `ERROR` frame sent when a resourceVersion is too old.
pub(crate) fn gone_frame() -> StreamFrame {
    frame(
        "ERROR",
        json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "reason": "Expired",
            "code": 410
        }),
    )
}

pub(crate) fn node(name: &str, labels: &[(&str, &str)]) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            ),
            resource_version: Some("1".to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub(crate) fn node_object(name: &str, created: DateTime<Utc>, resource_version: &str) -> Value {
    let mut node = node(name, &[]);
    node.metadata.creation_timestamp = Some(Time(created));
    node.metadata.resource_version = Some(resource_version.to_string());
    serde_json::to_value(node).expect("node serializes")
}

/// An agent pod; `running` sets both the phase and the first container's readiness.
pub(crate) fn agent_pod(name: &str, node_name: &str, ip: &str, running: bool) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("kconmon".to_string()),
            labels: Some(BTreeMap::from([
                ("app".to_string(), "kconmon".to_string()),
                ("component".to_string(), "agent".to_string()),
            ])),
            resource_version: Some("1".to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node_name.to_string()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some(if running { "Running" } else { "Pending" }.to_string()),
            pod_ip: Some(ip.to_string()),
            container_statuses: Some(vec![ContainerStatus {
                name: "agent".to_string(),
                ready: running,
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

pub(crate) fn to_object<T: serde::Serialize>(resource: &T) -> Value {
    serde_json::to_value(resource).expect("resource serializes")
}

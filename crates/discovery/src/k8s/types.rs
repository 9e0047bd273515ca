use core::error::Error;
use std::fmt;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Deserialize;
use serde_json::Value;

/// Identifies one resource collection on the API server.
///
/// Watchers are keyed by this tuple, namespace scope included.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceIdentity {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: Option<String>,
}

impl ResourceIdentity {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
            namespace: None,
        }
    }

    /// Identity of a typed `k8s-openapi` resource, cluster wide.
    pub fn of<K: k8s_openapi::Resource>() -> Self {
        Self::new(K::GROUP, K::VERSION, K::KIND)
    }

    /// Restricts the identity to a namespace.
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// `v1` for the core group, `<group>/<version>` otherwise.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// The same identity without namespace scope, as used for registry lookups.
    pub(crate) fn type_key(&self) -> (String, String, String) {
        (self.group.clone(), self.version.clone(), self.kind.clone())
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.kind)?;
        if let Some(namespace) = &self.namespace {
            write!(f, " (namespace {namespace})")?;
        }
        Ok(())
    }
}

/// Normalized kind of a delivered watch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum EventType {
    #[display("ADDED")]
    Added,
    #[display("MODIFIED")]
    Modified,
    #[display("DELETED")]
    Deleted,
}

/// Which event types a registered handler wants to see.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EventSelection {
    #[default]
    All,
    Only(Vec<EventType>),
}

impl EventSelection {
    pub fn matches(&self, event_type: EventType) -> bool {
        match self {
            Self::All => true,
            Self::Only(types) => types.contains(&event_type),
        }
    }
}

/// Event type as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub(crate) enum WireEventType {
    Added,
    Modified,
    Deleted,
    Bookmark,
    Error,
}

impl WireEventType {
    pub(crate) fn normalized(self) -> Option<EventType> {
        match self {
            Self::Added => Some(EventType::Added),
            Self::Modified => Some(EventType::Modified),
            Self::Deleted => Some(EventType::Deleted),
            Self::Bookmark | Self::Error => None,
        }
    }
}

/// One decoded frame of a watch stream.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct WatchEvent {
    #[serde(rename = "type")]
    pub(crate) event_type: WireEventType,
    #[serde(default)]
    pub(crate) object: Value,
}

impl WatchEvent {
    /// Object metadata, `None` when the frame carries none.
    pub(crate) fn metadata(&self) -> Option<ObjectMeta> {
        let metadata = self.object.get("metadata")?;
        serde_json::from_value(metadata.clone()).ok()
    }

    /// HTTP code embedded in an `ERROR` frame's `Status` object.
    pub(crate) fn status_code(&self) -> Option<u64> {
        self.object.get("code").and_then(Value::as_u64)
    }
}

/// Errors that can occur during Kubernetes operations.
#[derive(Debug, derive_more::Display)]
pub enum KubernetesError {
    #[display("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[display("Kubernetes API returned status {status_code}: {message}")]
    Api { status_code: u16, message: String },
    #[display("No API registered for {identity}")]
    UnknownResource { identity: String },
    #[display("{identity} is cluster scoped and cannot be namespaced")]
    InvalidScope { identity: String },
    #[display("Failed to decode resource: {message}")]
    Decode { message: String },
    #[display("Invalid patch: {message}")]
    InvalidPatch { message: String },
    #[display("API initialisation did not complete within {timeout:?}")]
    InitTimeout { timeout: Duration },
    #[display("Unable to reconnect {identity} to kubernetes after {deadline:?}")]
    ReconnectDeadlineExceeded { identity: String, deadline: Duration },
}

impl Error for KubernetesError {}

/// Decodes a raw object into a typed resource.
///
/// List items come back without `apiVersion`/`kind`, so those are filled in
/// from the target type before deserializing.
pub fn decode<K>(mut object: Value) -> Result<K, error_stack::Report<KubernetesError>>
where
    K: k8s_openapi::Resource + serde::de::DeserializeOwned,
{
    if let Value::Object(map) = &mut object {
        map.entry("apiVersion")
            .or_insert_with(|| Value::String(K::API_VERSION.to_string()));
        map.entry("kind")
            .or_insert_with(|| Value::String(K::KIND.to_string()));
    }
    serde_json::from_value(object).map_err(|e| {
        error_stack::Report::new(KubernetesError::Decode {
            message: format!("{}: {e}", K::KIND),
        })
    })
}

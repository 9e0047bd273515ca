//! Request/response and streaming access to the cluster API.
//!
//! [`ResourceClient`] is the seam between the watch engine and the API
//! server. Objects cross it as raw JSON; callers decode into typed
//! `k8s-openapi` structs. There is no retry logic at this layer.

use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::SubsecRound;
use chrono::Utc;
use error_stack::Report;
use futures::stream::BoxStream;
use json_patch::AddOperation;
use json_patch::PatchOperation;
use serde_json::json;
use serde_json::Value;

use crate::k8s::registry::ApiRegistry;
use crate::k8s::types::KubernetesError;
use crate::k8s::types::ResourceIdentity;

const STATUS_CONDITIONS_APPEND: &str = "/status/conditions/-";

/// Options for opening one watch stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOptions {
    /// How long the connection may stay silent before the client gives up on it.
    pub timeout: Duration,
    /// Resume point; `None` asks the server for a full relist.
    pub resource_version: Option<String>,
}

/// Why a stream stopped producing data.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum StreamError {
    #[display("no data received within {_0:?}")]
    ReadTimeout(Duration),
    #[display("{_0}")]
    Transport(String),
}

/// One item produced by an open watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Data(Value),
    Error(StreamError),
    End,
}

pub type WatchStream = BoxStream<'static, StreamFrame>;

/// Body of a patch request.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchKind {
    /// `application/merge-patch+json`
    Merge(Value),
    /// `application/json-patch+json`
    Json(json_patch::Patch),
}

/// Which part of the resource a patch is sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchTarget {
    Resource,
    Status,
}

/// A patch ready to be sent.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedPatch {
    pub target: PatchTarget,
    pub patch: PatchKind,
}

impl PatchKind {
    /// Routes status-condition appends to the `/status` subresource.
    ///
    /// A JSON patch whose first operation appends to `/status/conditions`
    /// goes to the status subresource, and its condition is stamped with a
    /// `lastTransitionTime` truncated to whole seconds.
    pub fn prepare(self, now: DateTime<Utc>) -> Result<PreparedPatch, Report<KubernetesError>> {
        let mut patch = match self {
            Self::Merge(body) => {
                if !body.is_object() {
                    return Err(Report::new(KubernetesError::InvalidPatch {
                        message: "merge patch body must be a JSON object".to_string(),
                    }));
                }
                return Ok(PreparedPatch {
                    target: PatchTarget::Resource,
                    patch: Self::Merge(body),
                });
            }
            Self::Json(patch) => patch,
        };

        if patch.0.is_empty() {
            return Err(Report::new(KubernetesError::InvalidPatch {
                message: "json patch has no operations".to_string(),
            }));
        }

        let target = match patch.0.first_mut() {
            Some(PatchOperation::Add(op)) if op.path == STATUS_CONDITIONS_APPEND => {
                let Value::Object(condition) = &mut op.value else {
                    return Err(Report::new(KubernetesError::InvalidPatch {
                        message: "status condition must be a JSON object".to_string(),
                    }));
                };
                condition.insert(
                    "lastTransitionTime".to_string(),
                    Value::String(transition_time(now)),
                );
                PatchTarget::Status
            }
            _ => PatchTarget::Resource,
        };

        Ok(PreparedPatch {
            target,
            patch: Self::Json(patch),
        })
    }
}

fn transition_time(now: DateTime<Utc>) -> String {
    let seconds = now.trunc_subsecs(0).to_rfc3339_opts(SecondsFormat::Secs, true);
    // `...:SSZ` -> `...:SS.000000Z`
    format!("{}.000000Z", seconds.trim_end_matches('Z'))
}

/// JSON patch appending a `{type, status}` condition to a resource's status.
pub fn status_condition_patch(condition_type: &str, status: &str) -> json_patch::Patch {
    json_patch::Patch(vec![PatchOperation::Add(AddOperation {
        path: STATUS_CONDITIONS_APPEND.to_string(),
        value: json!({ "type": condition_type, "status": status }),
    })])
}

/// Access to the cluster API surface.
#[async_trait]
pub trait ResourceClient: Send + Sync + 'static {
    /// Resource types this client can address.
    fn registry(&self) -> &ApiRegistry;

    /// Loads and validates the API surface. Called once per process.
    async fn init(&self) -> Result<(), Report<KubernetesError>>;

    /// Fetches one object; `Ok(None)` when it does not exist.
    async fn get(
        &self,
        identity: &ResourceIdentity,
        name: &str,
    ) -> Result<Option<Value>, Report<KubernetesError>>;

    /// Lists objects, optionally filtered by a label selector.
    async fn select(
        &self,
        identity: &ResourceIdentity,
        label_selector: Option<&str>,
    ) -> Result<Vec<Value>, Report<KubernetesError>>;

    /// Opens one long-lived watch connection.
    async fn open_stream(
        &self,
        identity: &ResourceIdentity,
        options: &StreamOptions,
    ) -> Result<WatchStream, Report<KubernetesError>>;

    async fn patch(
        &self,
        identity: &ResourceIdentity,
        name: &str,
        patch: PatchKind,
    ) -> Result<(), Report<KubernetesError>>;

    /// Appends a status condition to the named object.
    async fn add_status_condition(
        &self,
        identity: &ResourceIdentity,
        name: &str,
        condition_type: &str,
        status: &str,
    ) -> Result<(), Report<KubernetesError>> {
        let patch = status_condition_patch(condition_type, status);
        self.patch(identity, name, PatchKind::Json(patch)).await
    }
}

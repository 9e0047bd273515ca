//! Static mapping from resource types to their API paths.

use std::any::TypeId;
use std::collections::HashMap;

use error_stack::Report;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::NamespaceResourceScope;
use kube::core::ApiResource;
use kube::core::GroupVersionKind;

use crate::k8s::types::KubernetesError;
use crate::k8s::types::ResourceIdentity;

/// Path information for one registered resource type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiEntry {
    pub plural: String,
    pub namespaced: bool,
}

/// Registry of the resource types this process talks to.
#[derive(Debug, Clone, Default)]
pub struct ApiRegistry {
    entries: HashMap<(String, String, String), ApiEntry>,
}

impl ApiRegistry {
    /// Registry seeded with the kinds discovery reads: nodes and pods.
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        registry.register::<Node>();
        registry.register::<Pod>();
        registry
    }

    pub fn register<K>(&mut self)
    where
        K: k8s_openapi::Resource,
        K::Scope: 'static,
    {
        let namespaced = TypeId::of::<K::Scope>() == TypeId::of::<NamespaceResourceScope>();
        self.insert(
            ResourceIdentity::of::<K>(),
            ApiEntry {
                plural: K::URL_PATH_SEGMENT.to_string(),
                namespaced,
            },
        );
    }

    pub fn insert(&mut self, identity: ResourceIdentity, entry: ApiEntry) {
        self.entries.insert(identity.type_key(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered identities with their entries.
    pub fn iter(&self) -> impl Iterator<Item = (ResourceIdentity, &ApiEntry)> {
        self.entries
            .iter()
            .map(|((group, version, kind), entry)| {
                (ResourceIdentity::new(group, version, kind), entry)
            })
    }

    /// Looks up an identity, checking that its namespace scope is valid.
    ///
    /// # Errors
    ///
    /// - [`KubernetesError::UnknownResource`] if the type was never registered
    /// - [`KubernetesError::InvalidScope`] if a cluster scoped kind carries a namespace
    pub fn lookup(&self, identity: &ResourceIdentity) -> Result<&ApiEntry, Report<KubernetesError>> {
        let entry = self.entries.get(&identity.type_key()).ok_or_else(|| {
            Report::new(KubernetesError::UnknownResource {
                identity: identity.to_string(),
            })
        })?;
        if identity.namespace.is_some() && !entry.namespaced {
            return Err(Report::new(KubernetesError::InvalidScope {
                identity: identity.to_string(),
            }));
        }
        Ok(entry)
    }

    /// Collection URL path, e.g. `/api/v1/namespaces/kconmon/pods`.
    pub fn collection_path(
        &self,
        identity: &ResourceIdentity,
    ) -> Result<String, Report<KubernetesError>> {
        let entry = self.lookup(identity)?;
        let prefix = if identity.group.is_empty() {
            format!("/api/{}", identity.version)
        } else {
            format!("/apis/{}/{}", identity.group, identity.version)
        };
        Ok(match &identity.namespace {
            Some(namespace) => format!("{prefix}/namespaces/{namespace}/{}", entry.plural),
            None => format!("{prefix}/{}", entry.plural),
        })
    }

    /// The dynamic `kube` descriptor for an identity.
    pub fn api_resource(
        &self,
        identity: &ResourceIdentity,
    ) -> Result<ApiResource, Report<KubernetesError>> {
        let entry = self.lookup(identity)?;
        let gvk = GroupVersionKind::gvk(&identity.group, &identity.version, &identity.kind);
        Ok(ApiResource::from_gvk_with_plural(&gvk, &entry.plural))
    }
}

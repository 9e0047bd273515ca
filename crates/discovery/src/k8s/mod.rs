//! Kubernetes access: the resource client, its API registry, and the
//! resilient watch machinery built on top of it.

pub mod client;
pub mod kube_client;
pub mod multiplexer;
pub mod registry;
pub mod types;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testing;

pub use client::PatchKind;
pub use client::ResourceClient;
pub use client::StreamFrame;
pub use client::StreamOptions;
pub use kube_client::init_kube_client;
pub use kube_client::KubeResourceClient;
pub use multiplexer::WatchMultiplexer;
pub use registry::ApiRegistry;
pub use types::decode;
pub use types::EventSelection;
pub use types::EventType;
pub use types::KubernetesError;
pub use types::ResourceIdentity;
pub use watcher::WatcherHandle;
pub use watcher::WatcherPhase;
pub use watcher::WatcherSettings;

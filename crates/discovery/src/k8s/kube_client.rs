use std::path::PathBuf;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use futures::AsyncBufReadExt;
use futures::StreamExt;
use futures::TryStreamExt;
use kube::api::DynamicObject;
use kube::api::ListParams;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::api::WatchParams;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::core::GroupVersionKind;
use kube::Api;
use kube::Client;
use kube::Config;
use serde_json::json;
use serde_json::Value;
use tracing::debug;
use tracing::info;

use crate::k8s::client::PatchKind;
use crate::k8s::client::PatchTarget;
use crate::k8s::client::ResourceClient;
use crate::k8s::client::StreamError;
use crate::k8s::client::StreamFrame;
use crate::k8s::client::StreamOptions;
use crate::k8s::client::WatchStream;
use crate::k8s::registry::ApiRegistry;
use crate::k8s::types::KubernetesError;
use crate::k8s::types::ResourceIdentity;

pub async fn init_kube_client(
    kubeconfig: Option<PathBuf>,
) -> Result<Client, Report<KubernetesError>> {
    let client = match kubeconfig {
        Some(kubeconfig_path) => {
            info!(path = %kubeconfig_path.display(), "using kube config");
            let kubeconfig = Kubeconfig::read_from(&kubeconfig_path).change_context(
                KubernetesError::ConnectionFailed {
                    message: format!(
                        "Failed to read kubeconfig file: {}",
                        kubeconfig_path.display()
                    ),
                },
            )?;

            let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .change_context(KubernetesError::ConnectionFailed {
                    message: format!(
                        "Failed to create config from kubeconfig: {}",
                        kubeconfig_path.display()
                    ),
                })?;

            Client::try_from(config).change_context(KubernetesError::ConnectionFailed {
                message: "Failed to create Kubernetes client from custom kubeconfig".to_string(),
            })?
        }
        None => {
            // in-cluster service account, falling back to ~/.kube/config
            Client::try_default()
                .await
                .change_context(KubernetesError::ConnectionFailed {
                    message: "Failed to create Kubernetes client".to_string(),
                })?
        }
    };
    Ok(client)
}

/// Maps a `kube` error to the adapter's error type, keeping API status codes.
fn api_error(err: kube::Error) -> Report<KubernetesError> {
    match err {
        kube::Error::Api(response) => Report::new(KubernetesError::Api {
            status_code: response.code,
            message: response.message,
        }),
        other => Report::new(KubernetesError::ConnectionFailed {
            message: other.to_string(),
        }),
    }
}

fn to_value(object: DynamicObject) -> Result<Value, Report<KubernetesError>> {
    serde_json::to_value(object).map_err(|e| {
        Report::new(KubernetesError::Decode {
            message: e.to_string(),
        })
    })
}

/// Drops the empty `resourceVersion=` pair so a relist omits the parameter.
fn without_empty_version(uri: &str) -> String {
    let Some((path, query)) = uri.split_once('?') else {
        return uri.to_string();
    };
    let pairs: Vec<&str> = query
        .split('&')
        .filter(|pair| !pair.is_empty() && *pair != "resourceVersion=")
        .collect();
    if pairs.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{}", pairs.join("&"))
    }
}

/// Frame standing in for a watch response that was refused outright.
///
/// `None` for a successful status, in which case the body carries events.
/// A `410 Gone` becomes an `ERROR` event so the watcher relists; anything
/// else is a fault, even when the body is empty.
fn status_frame(status: u16) -> Option<StreamFrame> {
    match status {
        200..=299 => None,
        410 => Some(StreamFrame::Data(json!({
            "type": "ERROR",
            "object": { "kind": "Status", "code": 410, "reason": "Expired" },
        }))),
        _ => Some(StreamFrame::Error(StreamError::Transport(format!(
            "watch rejected with status {status}"
        )))),
    }
}

/// Turns one line of a watch response body into a frame.
///
/// A rejected watch (RBAC, server errors) answers with a bare `Status`
/// body instead of events; that is a fault, except for `410 Gone`, which is
/// handed on as an `ERROR` event so the watcher relists.
fn decode_line(line: &str) -> Option<StreamFrame> {
    if line.trim().is_empty() {
        return None;
    }
    let value = match serde_json::from_str::<Value>(line) {
        Ok(value) => value,
        Err(e) => {
            return Some(StreamFrame::Error(StreamError::Transport(format!(
                "undecodable watch frame: {e}"
            ))))
        }
    };
    let is_status = value.get("type").is_none()
        && value.get("kind").and_then(Value::as_str) == Some("Status");
    if !is_status {
        return Some(StreamFrame::Data(value));
    }
    let code = value.get("code").and_then(Value::as_u64).unwrap_or_default();
    if code == 410 {
        return Some(StreamFrame::Data(json!({ "type": "ERROR", "object": value })));
    }
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Some(StreamFrame::Error(StreamError::Transport(format!(
        "watch rejected with status {code}: {message}"
    ))))
}

/// [`ResourceClient`] backed by a live `kube` client.
#[derive(Clone)]
pub struct KubeResourceClient {
    client: Client,
    registry: ApiRegistry,
}

impl KubeResourceClient {
    pub fn new(client: Client, registry: ApiRegistry) -> Self {
        Self { client, registry }
    }

    fn dynamic_api(
        &self,
        identity: &ResourceIdentity,
    ) -> Result<Api<DynamicObject>, Report<KubernetesError>> {
        let resource = self.registry.api_resource(identity)?;
        Ok(match &identity.namespace {
            Some(namespace) => Api::namespaced_with(self.client.clone(), namespace, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        })
    }

    /// Checks one registry entry against the server's discovery document.
    async fn validate_entry(
        &self,
        identity: ResourceIdentity,
        plural: String,
    ) -> Result<(), Report<KubernetesError>> {
        let gvk = GroupVersionKind::gvk(&identity.group, &identity.version, &identity.kind);
        let (resource, _capabilities) = kube::discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(api_error)
            .attach_printable_lazy(|| format!("discovering {identity}"))?;
        if resource.plural != plural {
            return Err(Report::new(KubernetesError::UnknownResource {
                identity: identity.to_string(),
            })
            .attach_printable(format!(
                "registered path segment {plural} but server serves {}",
                resource.plural
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    fn registry(&self) -> &ApiRegistry {
        &self.registry
    }

    async fn init(&self) -> Result<(), Report<KubernetesError>> {
        let version = self.client.apiserver_version().await.map_err(api_error)?;
        info!(
            major = %version.major,
            minor = %version.minor,
            "connected to kubernetes api server"
        );

        let checks = self
            .registry
            .iter()
            .map(|(identity, entry)| self.validate_entry(identity, entry.plural.clone()));
        futures::future::try_join_all(checks).await?;
        debug!(kinds = self.registry.len(), "api registry validated");
        Ok(())
    }

    async fn get(
        &self,
        identity: &ResourceIdentity,
        name: &str,
    ) -> Result<Option<Value>, Report<KubernetesError>> {
        let api = self.dynamic_api(identity)?;
        match api.get_opt(name).await.map_err(api_error)? {
            Some(object) => Ok(Some(to_value(object)?)),
            None => Ok(None),
        }
    }

    async fn select(
        &self,
        identity: &ResourceIdentity,
        label_selector: Option<&str>,
    ) -> Result<Vec<Value>, Report<KubernetesError>> {
        let api = self.dynamic_api(identity)?;
        let params = match label_selector {
            Some(selector) => ListParams::default().labels(selector),
            None => ListParams::default(),
        };
        let list = api.list(&params).await.map_err(api_error)?;
        list.items.into_iter().map(to_value).collect()
    }

    async fn open_stream(
        &self,
        identity: &ResourceIdentity,
        options: &StreamOptions,
    ) -> Result<WatchStream, Report<KubernetesError>> {
        let path = self.registry.collection_path(identity)?;
        let params = WatchParams {
            bookmarks: true,
            ..WatchParams::default()
        };
        let version = options.resource_version.as_deref().unwrap_or("");
        let mut request = kube::core::Request::new(path)
            .watch(&params, version)
            .map_err(|e| {
                Report::new(KubernetesError::ConnectionFailed {
                    message: format!("Failed to build watch request: {e}"),
                })
            })?;
        if options.resource_version.is_none() {
            let uri = without_empty_version(&request.uri().to_string());
            *request.uri_mut() = uri.parse().map_err(|_| {
                Report::new(KubernetesError::ConnectionFailed {
                    message: format!("Invalid watch uri: {uri}"),
                })
            })?;
        }

        let client = self.client.clone();
        let read_timeout = options.timeout;
        let frames = async_stream::stream! {
            let response = match client.send(request.map(Into::into)).await {
                Ok(response) => response,
                Err(e) => {
                    yield StreamFrame::Error(StreamError::Transport(e.to_string()));
                    return;
                }
            };
            if let Some(frame) = status_frame(response.status().as_u16()) {
                yield frame;
                return;
            }
            let reader = response
                .into_body()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
                .into_async_read();
            let mut lines = Box::pin(reader).lines();
            loop {
                match tokio::time::timeout(read_timeout, lines.next()).await {
                    Err(_) => {
                        yield StreamFrame::Error(StreamError::ReadTimeout(read_timeout));
                        break;
                    }
                    Ok(None) => {
                        yield StreamFrame::End;
                        break;
                    }
                    Ok(Some(Err(e))) => {
                        yield StreamFrame::Error(StreamError::Transport(e.to_string()));
                        break;
                    }
                    Ok(Some(Ok(line))) => match decode_line(&line) {
                        None => continue,
                        Some(frame @ StreamFrame::Error(_)) => {
                            yield frame;
                            break;
                        }
                        Some(frame) => {
                            yield frame;
                        }
                    },
                }
            }
        };
        Ok(frames.boxed())
    }

    async fn patch(
        &self,
        identity: &ResourceIdentity,
        name: &str,
        patch: PatchKind,
    ) -> Result<(), Report<KubernetesError>> {
        let api = self.dynamic_api(identity)?;
        let prepared = patch.prepare(chrono::Utc::now())?;
        let params = PatchParams::default();
        let result = match (prepared.target, prepared.patch) {
            (PatchTarget::Resource, PatchKind::Merge(body)) => {
                api.patch(name, &params, &Patch::Merge(&body)).await
            }
            (PatchTarget::Resource, PatchKind::Json(ops)) => {
                api.patch(name, &params, &Patch::Json::<()>(ops)).await
            }
            (PatchTarget::Status, PatchKind::Merge(body)) => {
                api.patch_status(name, &params, &Patch::Merge(&body)).await
            }
            (PatchTarget::Status, PatchKind::Json(ops)) => {
                api.patch_status(name, &params, &Patch::Json::<()>(ops)).await
            }
        };
        result.map(|_| ()).map_err(api_error)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    use k8s_openapi::api::core::v1::Node;
    use poem::handler;
    use poem::http::StatusCode as PoemStatus;
    use poem::listener::TcpAcceptor;
    use poem::web::Data;
    use poem::EndpointExt;
    use poem::Route;
    use poem::Server;
    use similar_asserts::assert_eq;
    use test_log::test;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::k8s::watcher::OpenStreams;
    use crate::k8s::watcher::ResourceWatcher;
    use crate::k8s::watcher::WatcherPhase;
    use crate::k8s::watcher::WatcherSettings;

    #[test]
    fn relist_omits_resource_version() {
        assert_eq!(
            without_empty_version(
                "/api/v1/nodes?&watch=true&timeoutSeconds=290&allowWatchBookmarks=true&resourceVersion="
            ),
            "/api/v1/nodes?watch=true&timeoutSeconds=290&allowWatchBookmarks=true"
        );
        assert_eq!(
            without_empty_version("/api/v1/nodes?watch=true&resourceVersion=226835919"),
            "/api/v1/nodes?watch=true&resourceVersion=226835919"
        );
    }

    #[test]
    fn watch_events_pass_through() {
        let line = r#"{"type":"ADDED","object":{"kind":"Node","metadata":{"name":"n1"}}}"#;

        assert_eq!(
            decode_line(line),
            Some(StreamFrame::Data(json!({
                "type": "ADDED",
                "object": { "kind": "Node", "metadata": { "name": "n1" } }
            })))
        );
        assert_eq!(decode_line("  "), None);
    }

    #[test]
    fn rejected_watch_is_a_fault() {
        let line = r#"{"kind":"Status","apiVersion":"v1","status":"Failure","message":"nodes is forbidden","reason":"Forbidden","code":403}"#;

        assert_eq!(
            decode_line(line),
            Some(StreamFrame::Error(StreamError::Transport(
                "watch rejected with status 403: nodes is forbidden".to_string()
            )))
        );
    }

    #[test]
    fn expired_watch_becomes_an_error_event() {
        let line = r#"{"kind":"Status","apiVersion":"v1","status":"Failure","reason":"Expired","code":410}"#;

        let Some(StreamFrame::Data(event)) = decode_line(line) else {
            panic!("expected an event");
        };
        assert_eq!(event["type"], "ERROR");
        assert_eq!(event["object"]["code"], 410);
    }

    #[test]
    fn refused_watch_responses_become_frames() {
        assert_eq!(status_frame(200), None);
        assert_eq!(
            status_frame(503),
            Some(StreamFrame::Error(StreamError::Transport(
                "watch rejected with status 503".to_string()
            )))
        );
        let Some(StreamFrame::Data(event)) = status_frame(410) else {
            panic!("expected an event");
        };
        assert_eq!(event["type"], "ERROR");
        assert_eq!(event["object"]["code"], 410);
    }

    #[handler]
    fn unavailable(state: Data<&Arc<AtomicUsize>>) -> PoemStatus {
        state.fetch_add(1, Ordering::SeqCst);
        PoemStatus::SERVICE_UNAVAILABLE
    }

    #[test(tokio::test)]
    async fn empty_error_response_backs_off_until_fatal() {
        let requests = Arc::new(AtomicUsize::new(0));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("should bind");
        let addr = listener.local_addr().expect("should have address");
        let acceptor = TcpAcceptor::from_tokio(listener).expect("should wrap listener");
        let app = Route::new()
            .at("/api/v1/nodes", poem::get(unavailable))
            .data(requests.clone());
        tokio::spawn(async move {
            let _ = Server::new_with_acceptor(acceptor).run(app).await;
        });

        let config = Config::new(format!("http://{addr}").parse().expect("valid uri"));
        let client = Client::try_from(config).expect("client should build");
        let settings = WatcherSettings {
            watch_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(200),
            reconnect_deadline: Duration::from_millis(1000),
        };
        let (watcher, handle) = ResourceWatcher::new(
            ResourceIdentity::of::<Node>(),
            Arc::new(KubeResourceClient::new(client, ApiRegistry::builtin())),
            settings,
            OpenStreams::default(),
            CancellationToken::new(),
            Box::new(|_, _| {}),
        );

        let result = watcher.run(None).await;

        let err = result.expect_err("watcher should give up");
        assert!(matches!(
            err.current_context(),
            KubernetesError::ReconnectDeadlineExceeded { .. }
        ));
        assert_eq!(handle.status().phase, WatcherPhase::Fatal);
        let served = requests.load(Ordering::SeqCst);
        assert!((2..=7).contains(&served), "served {served} watch requests");
    }

    #[test]
    fn garbage_is_a_fault() {
        assert!(matches!(
            decode_line("<html>bad gateway</html>"),
            Some(StreamFrame::Error(StreamError::Transport(_)))
        ));
    }
}

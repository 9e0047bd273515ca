use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::debug;
use tracing::error;

use super::types::Agent;
use super::types::DiscoveryConfig;
use super::types::DiscoveryError;
use super::Discovery;

pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(500);
pub const RETRY_LIMIT: u32 = 2;
/// Pause before the first retry; doubles for each further attempt.
pub const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Discovery through the controller's HTTP API, for processes without
/// cluster credentials.
pub struct ServiceDiscovery {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
    retries: u32,
    retry_delay: Duration,
    last_result: Mutex<Vec<Agent>>,
}

impl ServiceDiscovery {
    pub fn new(config: &DiscoveryConfig) -> Self {
        Self::with_base_url(config.controller_url())
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: REQUEST_TIMEOUT,
            retries: RETRY_LIMIT,
            retry_delay: RETRY_DELAY,
            last_result: Mutex::new(Vec::new()),
        }
    }

    fn last_result(&self) -> Vec<Agent> {
        self.last_result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// GETs `path`, retrying transport faults and server errors.
    ///
    /// `Ok(None)` when the controller answers 404.
    async fn fetch<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Option<T>, Report<DiscoveryError>> {
        let url = format!("{}{path}", self.base_url);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let failure = match self.http.get(&url).timeout(self.timeout).send().await {
                Ok(response) if response.status() == StatusCode::NOT_FOUND => return Ok(None),
                Ok(response) if response.status().is_success() => {
                    return response.json::<T>().await.map(Some).map_err(|e| {
                        Report::new(DiscoveryError::Controller {
                            message: format!("invalid response from {url}: {e}"),
                        })
                    });
                }
                Ok(response) if response.status().is_server_error() => {
                    format!("{url} responded with {}", response.status())
                }
                Ok(response) => {
                    return Err(Report::new(DiscoveryError::Controller {
                        message: format!("{url} responded with {}", response.status()),
                    }));
                }
                Err(e) => format!("request to {url} failed: {e}"),
            };
            if attempt > self.retries {
                return Err(Report::new(DiscoveryError::Controller { message: failure })
                    .attach_printable(format!("gave up after {attempt} attempts")));
            }
            let delay = self.retry_delay * 2u32.pow(attempt - 1);
            debug!(attempt, ?delay, "{failure}, retrying");
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Discovery for ServiceDiscovery {
    async fn start(&self) -> Result<(), Report<DiscoveryError>> {
        Ok(())
    }

    async fn stop(&self) {}

    /// Falls back to the last successful answer when the controller is unreachable.
    async fn agents(&self) -> Vec<Agent> {
        match self.fetch::<Vec<Agent>>("/agents").await {
            Ok(Some(agents)) => {
                *self
                    .last_result
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = agents.clone();
                agents
            }
            Ok(None) => {
                error!("controller does not serve /agents");
                self.last_result()
            }
            Err(report) => {
                error!("failed to retrieve current agent list from controller: {report:?}");
                self.last_result()
            }
        }
    }

    async fn agent(&self, name: &str) -> Result<Option<Agent>, Report<DiscoveryError>> {
        match self.fetch::<Agent>(&format!("/agent/{name}")).await {
            Ok(agent) => Ok(agent),
            Err(report) => {
                error!("failed to retrieve real time agent information from controller: {report:?}");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use poem::handler;
    use poem::http::StatusCode as PoemStatus;
    use poem::listener::TcpAcceptor;
    use poem::web::Data;
    use poem::web::Json;
    use poem::web::Path;
    use poem::EndpointExt;
    use poem::Route;
    use poem::Server;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    #[derive(Default)]
    struct Controller {
        agents_calls: AtomicUsize,
        /// `/agents` fails once the call count exceeds this.
        healthy_calls: usize,
    }

    fn p1() -> Agent {
        Agent {
            name: "p1".to_string(),
            node_name: "n1".to_string(),
            ip: "1.2.3.4".to_string(),
            zone: "europe-west4-a".to_string(),
        }
    }

    #[handler]
    fn list_agents(state: Data<&Arc<Controller>>) -> poem::Result<Json<Vec<Agent>>> {
        let call = state.agents_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call > state.healthy_calls {
            return Err(poem::Error::from_status(PoemStatus::INTERNAL_SERVER_ERROR));
        }
        Ok(Json(vec![p1()]))
    }

    #[handler]
    fn get_agent(Path(name): Path<String>) -> poem::Result<Json<Agent>> {
        if name == "p1" {
            Ok(Json(p1()))
        } else {
            Err(poem::Error::from_status(PoemStatus::NOT_FOUND))
        }
    }

    async fn serve(controller: Arc<Controller>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("should bind");
        let addr = listener.local_addr().expect("should have address");
        let acceptor = TcpAcceptor::from_tokio(listener).expect("should wrap listener");
        let app = Route::new()
            .at("/agents", poem::get(list_agents))
            .at("/agent/:name", poem::get(get_agent))
            .data(controller);
        tokio::spawn(async move {
            let _ = Server::new_with_acceptor(acceptor).run(app).await;
        });
        format!("http://{addr}")
    }

    #[test(tokio::test)]
    async fn agents_keeps_last_result_when_controller_fails() {
        let controller = Arc::new(Controller {
            healthy_calls: 1,
            ..Default::default()
        });
        let sut = ServiceDiscovery::with_base_url(serve(controller.clone()).await);

        assert_eq!(sut.agents().await, vec![p1()]);
        assert_eq!(sut.agents().await, vec![p1()]);

        // one success, then the initial try plus two retries
        assert_eq!(controller.agents_calls.load(Ordering::SeqCst), 4);
    }

    #[test(tokio::test)]
    async fn retries_back_off_between_attempts() {
        let controller = Arc::new(Controller::default());
        let sut = ServiceDiscovery::with_base_url(serve(controller.clone()).await);
        let started = std::time::Instant::now();

        assert!(sut.agents().await.is_empty());

        assert_eq!(controller.agents_calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= RETRY_DELAY * 3);
    }

    #[test(tokio::test)]
    async fn agent_lookup_maps_not_found_to_none() {
        let sut = ServiceDiscovery::with_base_url(serve(Arc::default()).await);

        assert_eq!(sut.agent("p1").await.expect("lookup succeeds"), Some(p1()));
        assert_eq!(sut.agent("p2").await.expect("lookup succeeds"), None);
    }

    #[test(tokio::test)]
    async fn unreachable_controller_yields_empty_results() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("should bind");
        let addr = listener.local_addr().expect("should have address");
        drop(listener);
        let sut = ServiceDiscovery::with_base_url(format!("http://{addr}/"));

        assert!(sut.agents().await.is_empty());
        assert_eq!(sut.agent("p1").await.expect("lookup never fails"), None);
    }

    #[test]
    fn base_url_defaults_to_controller_service() {
        let sut = ServiceDiscovery::new(&DiscoveryConfig::default());
        assert_eq!(sut.base_url, "http://controller.kconmon.svc.cluster.local");
    }
}

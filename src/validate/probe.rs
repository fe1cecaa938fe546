//! Single-endpoint liveness and latency probe

use crate::validate::config::{ProbeMethod, RunConfig};
use crate::validate::error::SetupError;
use crate::validate::models::{Endpoint, FailureReason, ProbeResult};
use async_trait::async_trait;
use reqwest::header::USER_AGENT;
use reqwest::redirect::Policy;
use reqwest::{Client, Method, Proxy as ReqwestProxy, StatusCode, Url};
use std::error::Error as StdError;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// One bounded-time check of an endpoint.
///
/// Implementations perform exactly one logical attempt and never retry;
/// every outcome, including transport errors, is folded into the
/// returned [`ProbeResult`].
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, endpoint: &Endpoint) -> ProbeResult;
}

/// Probe that requests the test target through the endpoint as an HTTP proxy
pub struct HttpProbe {
    target: Url,
    timeout: Duration,
    method: ProbeMethod,
    user_agents: Vec<String>,
    next_agent: AtomicUsize,
}

impl HttpProbe {
    pub fn from_config(config: &RunConfig) -> Result<Self, SetupError> {
        let target = config.validate()?;
        Ok(Self {
            target,
            timeout: config.per_probe_timeout,
            method: config.probe_method,
            user_agents: config.user_agents.clone(),
            next_agent: AtomicUsize::new(0),
        })
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Rotate through the pool in order
    fn next_user_agent(&self) -> Option<&str> {
        if self.user_agents.is_empty() {
            return None;
        }
        let index = self.next_agent.fetch_add(1, Ordering::Relaxed) % self.user_agents.len();
        Some(&self.user_agents[index])
    }

    /// Create a client routed through the endpoint. Redirects are returned
    /// as-is so a proxy answering with a 3xx still counts as alive.
    fn create_client(&self, endpoint: &Endpoint) -> reqwest::Result<Client> {
        let proxy = ReqwestProxy::all(endpoint.proxy_url())?;

        Client::builder()
            .proxy(proxy)
            .redirect(Policy::none())
            .timeout(self.timeout)
            .connect_timeout(self.timeout)
            .pool_max_idle_per_host(0)
            .build()
    }

    async fn send(
        &self,
        client: &Client,
        method: Method,
        agent: Option<&str>,
    ) -> reqwest::Result<StatusCode> {
        let mut request = client.request(method, self.target.clone());
        if let Some(agent) = agent {
            request = request.header(USER_AGENT, agent);
        }
        Ok(request.send().await?.status())
    }

    async fn attempt(&self, client: &Client, agent: Option<&str>) -> reqwest::Result<StatusCode> {
        match self.method {
            ProbeMethod::Head => self.send(client, Method::HEAD, agent).await,
            ProbeMethod::Get => self.send(client, Method::GET, agent).await,
            ProbeMethod::HeadThenGet => match self.send(client, Method::HEAD, agent).await {
                Ok(status) if is_alive(status) => Ok(status),
                _ => self.send(client, Method::GET, agent).await,
            },
        }
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, endpoint: &Endpoint) -> ProbeResult {
        let start = Instant::now();

        let client = match self.create_client(endpoint) {
            Ok(client) => client,
            Err(e) => {
                debug!(%endpoint, error = %e, "could not build proxied client");
                return ProbeResult::failure(endpoint.clone(), FailureReason::ProtocolError);
            }
        };

        let agent = self.next_user_agent();
        match tokio::time::timeout(self.timeout, self.attempt(&client, agent)).await {
            Ok(Ok(status)) if is_alive(status) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(%endpoint, latency_ms = elapsed, status = status.as_u16(), "probe succeeded");
                ProbeResult::success(endpoint.clone(), elapsed, status.as_u16())
            }
            Ok(Ok(status)) => {
                debug!(%endpoint, status = status.as_u16(), "probe rejected by status");
                ProbeResult::failure(endpoint.clone(), FailureReason::ProtocolError)
            }
            Ok(Err(e)) => {
                let reason = classify_error(&e);
                debug!(%endpoint, %reason, error = %e, "probe failed");
                ProbeResult::failure(endpoint.clone(), reason)
            }
            Err(_) => {
                debug!(%endpoint, timeout_ms = self.timeout.as_millis() as u64, "probe timed out");
                ProbeResult::timeout(endpoint.clone())
            }
        }
    }
}

/// 2xx and unfollowed 3xx both prove the proxy forwarded the request
fn is_alive(status: StatusCode) -> bool {
    status.is_success() || status.is_redirection()
}

/// Map a transport error onto a failure reason by walking its source chain
pub(crate) fn classify_error(err: &reqwest::Error) -> FailureReason {
    if err.is_timeout() {
        return FailureReason::Timeout;
    }

    let mut source: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = source {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            match io_err.kind() {
                io::ErrorKind::ConnectionRefused => return FailureReason::ConnectionRefused,
                io::ErrorKind::TimedOut => return FailureReason::Timeout,
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof => return FailureReason::ProtocolError,
                _ => {}
            }
        }
        let message = e.to_string().to_lowercase();
        if message.contains("dns error") || message.contains("failed to lookup address") {
            return FailureReason::DnsError;
        }
        if message.contains("tunnel") {
            return FailureReason::ProtocolError;
        }
        source = e.source();
    }

    if err.is_connect() {
        FailureReason::Other
    } else if err.is_request()
        || err.is_body()
        || err.is_decode()
        || err.is_redirect()
        || err.is_status()
        || err.is_builder()
    {
        FailureReason::ProtocolError
    } else {
        FailureReason::Other
    }
}

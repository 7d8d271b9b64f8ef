use crate::{
    http::create_proxied_client,
    proxy::Proxy,
    types::{ProbeConfig, ProbeOutcome, DEFAULT_USER_AGENTS},
};
use async_trait::async_trait;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use reqwest::{header, Client, StatusCode};
use std::time::Duration;

/// Canonical profile URL for `handle` under `base`.
pub fn profile_url(base: &str, handle: &str) -> String {
    format!("{}/@{}", base.trim_end_matches('/'), handle)
}

pub fn classify(status: StatusCode) -> ProbeOutcome {
    match status {
        StatusCode::NOT_FOUND => ProbeOutcome::Available,
        StatusCode::OK => ProbeOutcome::Taken,
        StatusCode::TOO_MANY_REQUESTS => ProbeOutcome::inconclusive("Rate limited"),
        status => ProbeOutcome::inconclusive(format!("HTTP {}", status.as_u16())),
    }
}

pub async fn check_handle(
    client: &Client,
    base: &str,
    handle: &str,
    user_agent: &str,
    timeout: Duration,
) -> ProbeOutcome {
    let url = profile_url(base, handle);
    let request = client.get(&url).header(header::USER_AGENT, user_agent).send();

    match tokio::time::timeout(timeout, request).await {
        Ok(Ok(response)) => classify(response.status()),
        Ok(Err(e)) => ProbeOutcome::inconclusive(format!("Request failed: {}", e)),
        Err(_) => ProbeOutcome::inconclusive("Timeout"),
    }
}

/// Performs one identity lookup through a given proxy.
#[async_trait]
pub trait HandleChecker: Send + Sync {
    async fn check(&self, proxy: &Proxy, handle: &str) -> ProbeOutcome;

    /// Drops any per-proxy state once the proxy has been evicted.
    fn forget(&self, _proxy: &Proxy) {}

    /// Drops per-proxy state for every proxy `keep` rejects.
    fn retain(&self, _keep: &(dyn Fn(&Proxy) -> bool + Sync)) {}
}

pub struct HttpChecker {
    base: String,
    timeout: Duration,
    user_agents: Vec<String>,
    clients: DashMap<Proxy, Client>,
}

impl HttpChecker {
    pub fn new(config: &ProbeConfig) -> Self {
        let user_agents = if config.user_agents.is_empty() {
            DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect()
        } else {
            config.user_agents.clone()
        };

        Self {
            base: config.lookup_base.clone(),
            timeout: config.timeout,
            user_agents,
            clients: DashMap::new(),
        }
    }

    fn client_for(&self, proxy: &Proxy) -> Result<Client, reqwest::Error> {
        if let Some(client) = self.clients.get(proxy) {
            return Ok(client.clone());
        }
        let client = create_proxied_client(self.timeout, proxy)?;
        self.clients.insert(proxy.clone(), client.clone());
        Ok(client)
    }

    fn pick_user_agent(&self) -> &str {
        self.user_agents
            .choose(&mut rand::thread_rng())
            .map(String::as_str)
            .unwrap_or(DEFAULT_USER_AGENTS[0])
    }
}

#[async_trait]
impl HandleChecker for HttpChecker {
    async fn check(&self, proxy: &Proxy, handle: &str) -> ProbeOutcome {
        let client = match self.client_for(proxy) {
            Ok(c) => c,
            Err(e) => return ProbeOutcome::inconclusive(format!("Bad proxy: {}", e)),
        };
        let user_agent = self.pick_user_agent().to_string();

        check_handle(&client, &self.base, handle, &user_agent, self.timeout).await
    }

    fn forget(&self, proxy: &Proxy) {
        self.clients.remove(proxy);
    }

    fn retain(&self, keep: &(dyn Fn(&Proxy) -> bool + Sync)) {
        self.clients.retain(|proxy, _| keep(proxy));
    }
}

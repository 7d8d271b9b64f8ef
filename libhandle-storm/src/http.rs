use crate::proxy::Proxy;
use reqwest::Client;
use std::time::Duration;

pub fn create_http_pool(timeout: Duration) -> Result<Client, reqwest::Error> {
    builder(timeout).pool_max_idle_per_host(100).build()
}

/// A client whose every request egresses through `proxy`.
pub fn create_proxied_client(timeout: Duration, proxy: &Proxy) -> Result<Client, reqwest::Error> {
    builder(timeout)
        .pool_max_idle_per_host(4)
        .proxy(reqwest::Proxy::all(proxy.to_url())?)
        .build()
}

fn builder(timeout: Duration) -> reqwest::ClientBuilder {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .tcp_nodelay(true)
        .use_rustls_tls()
}

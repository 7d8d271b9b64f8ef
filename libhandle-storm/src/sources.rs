use crate::proxy::{extract_proxies, Proxy, Scheme};
use async_trait::async_trait;
use reqwest::{header, Client};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;

pub const WEBSHARE_LIST_URL: &str =
    "https://proxy.webshare.io/api/v2/proxy/list/?mode=direct&page_size=100&page=1";
pub const WEBSHARE_API_KEY_ENV: &str = "WEBSHARE_API_KEY";

const PUBLIC_TEXT_LISTS: &[(&str, Scheme)] = &[
    ("https://www.proxy-list.download/api/v1/get?type=http", Scheme::Http),
    ("https://www.proxy-list.download/api/v1/get?type=https", Scheme::Http),
    ("https://raw.githubusercontent.com/TheSpeedX/PROXY-List/master/http.txt", Scheme::Http),
    ("https://raw.githubusercontent.com/TheSpeedX/PROXY-List/master/socks5.txt", Scheme::Socks5),
];

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to fetch proxy list from {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Proxy list at {url} answered HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("Unexpected payload from {url}: {reason}")]
    Schema { url: String, reason: String },
    #[error("Proxy source {0} timed out")]
    Timeout(String),
}

/// An upstream that hands out candidate proxies.
#[async_trait]
pub trait ProxySource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self) -> Result<Vec<Proxy>, SourceError>;
}

/// How a source is declared in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceSpec {
    /// Any text body; `ip:port` entries are pulled out by pattern.
    Text {
        url: String,
        #[serde(default)]
        scheme: Scheme,
    },
    /// A Webshare-style JSON proxy list behind token auth.
    Webshare {
        #[serde(default = "default_webshare_url")]
        url: String,
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default = "default_api_key_env")]
        api_key_env: String,
    },
}

fn default_webshare_url() -> String {
    WEBSHARE_LIST_URL.to_string()
}

fn default_api_key_env() -> String {
    WEBSHARE_API_KEY_ENV.to_string()
}

impl SourceSpec {
    /// Instantiates the source, or `None` when it cannot be used
    /// (a Webshare source without an API key).
    pub fn build(&self, client: &Client) -> Option<Arc<dyn ProxySource>> {
        match self {
            SourceSpec::Text { url, scheme } => {
                Some(Arc::new(TextListSource::new(client.clone(), url.clone(), *scheme)))
            }
            SourceSpec::Webshare {
                url,
                api_key,
                api_key_env,
            } => {
                let key = api_key
                    .clone()
                    .or_else(|| std::env::var(api_key_env).ok())
                    .filter(|k| !k.trim().is_empty());
                match key {
                    Some(key) => Some(Arc::new(WebshareSource::new(client.clone(), url.clone(), key))),
                    None => {
                        tracing::warn!(url = %url, env = %api_key_env, "Skipping Webshare source without API key");
                        None
                    }
                }
            }
        }
    }
}

pub fn default_sources() -> Vec<SourceSpec> {
    PUBLIC_TEXT_LISTS
        .iter()
        .map(|(url, scheme)| SourceSpec::Text {
            url: url.to_string(),
            scheme: *scheme,
        })
        .collect()
}

pub struct TextListSource {
    client: Client,
    url: String,
    scheme: Scheme,
}

impl TextListSource {
    pub fn new(client: Client, url: String, scheme: Scheme) -> Self {
        Self { client, url, scheme }
    }
}

#[async_trait]
impl ProxySource for TextListSource {
    fn name(&self) -> &str {
        &self.url
    }

    async fn fetch(&self) -> Result<Vec<Proxy>, SourceError> {
        let body = get_body(self.client.get(&self.url), &self.url).await?;
        Ok(extract_proxies(&body, self.scheme))
    }
}

pub struct WebshareSource {
    client: Client,
    url: String,
    api_key: String,
}

impl WebshareSource {
    pub fn new(client: Client, url: String, api_key: String) -> Self {
        Self { client, url, api_key }
    }
}

#[async_trait]
impl ProxySource for WebshareSource {
    fn name(&self) -> &str {
        &self.url
    }

    async fn fetch(&self) -> Result<Vec<Proxy>, SourceError> {
        let request = self
            .client
            .get(&self.url)
            .header(header::AUTHORIZATION, format!("Token {}", self.api_key));
        let body = get_body(request, &self.url).await?;

        parse_webshare(&body).map_err(|e| SourceError::Schema {
            url: self.url.clone(),
            reason: e.to_string(),
        })
    }
}

/// A fixed list, e.g. proxies supplied on the command line.
pub struct StaticSource {
    name: String,
    proxies: Vec<Proxy>,
}

impl StaticSource {
    pub fn new(name: impl Into<String>, proxies: Vec<Proxy>) -> Self {
        Self {
            name: name.into(),
            proxies,
        }
    }
}

#[async_trait]
impl ProxySource for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<Vec<Proxy>, SourceError> {
        Ok(self.proxies.clone())
    }
}

async fn get_body(request: reqwest::RequestBuilder, url: &str) -> Result<String, SourceError> {
    let fetch_err = |source| SourceError::Fetch {
        url: url.to_string(),
        source,
    };

    let response = request.send().await.map_err(fetch_err)?;
    let status = response.status();
    if !status.is_success() {
        return Err(SourceError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    response.text().await.map_err(fetch_err)
}

#[derive(Debug, Deserialize)]
struct WebshareList {
    results: Vec<WebshareProxy>,
}

#[derive(Debug, Deserialize)]
struct WebshareProxy {
    username: Option<String>,
    password: Option<String>,
    proxy_address: Option<String>,
    port: u16,
    #[serde(default = "default_valid")]
    valid: bool,
}

fn default_valid() -> bool {
    true
}

/// Entries without an address (backbone mode) or flagged invalid upstream
/// are dropped.
pub fn parse_webshare(body: &str) -> Result<Vec<Proxy>, serde_json::Error> {
    let list: WebshareList = serde_json::from_str(body)?;

    Ok(list
        .results
        .into_iter()
        .filter(|p| p.valid)
        .filter_map(|p| {
            let proxy = Proxy::new(p.proxy_address?, p.port);
            Some(match (p.username, p.password) {
                (Some(user), Some(pass)) => proxy.with_credentials(user, pass),
                _ => proxy,
            })
        })
        .collect())
}

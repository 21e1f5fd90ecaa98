use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, bail, Context};
use reqwest::header::{COOKIE, LOCATION};
use reqwest::redirect::Policy;
use reqwest::StatusCode;
use tracing::debug;

pub mod api;
pub mod error;

pub use error::{AuthenticationError, FetchError, ScraperError, ValidationError};

const PRODUCTION_BASE_URL: &str = "https://mans.e-st.lv";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REDIRECTS: usize = 10;

/// A page as the portal finally served it, after redirects.
#[derive(Debug, Clone)]
pub struct PortalResponse {
    pub status: u16,
    /// Path (and query) of the last URL in the redirect chain.
    pub final_path: String,
    /// Cookies set anywhere along the redirect chain.
    pub set_cookies: CookieJar,
    pub body: String,
}

impl PortalResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Name/value cookie store, sent back verbatim as a `Cookie` header.
///
/// Also remembers the names the server expired, so that absorbing a
/// response's cookies deletes them from the session.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CookieJar {
    cookies: BTreeMap<String, String>,
    expired: BTreeSet<String>,
}

impl CookieJar {
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.expired.remove(&name);
        self.cookies.insert(name, value.into());
    }

    pub fn expire(&mut self, name: impl Into<String>) {
        let name = name.into();
        self.cookies.remove(&name);
        self.expired.insert(name);
    }

    pub fn absorb(&mut self, other: &CookieJar) {
        for name in &other.expired {
            self.expire(name.clone());
        }
        for (name, value) in &other.cookies {
            self.insert(name.clone(), value.clone());
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn header_value(&self) -> String {
        self.cookies
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

// Cookie values are session secrets, only names get printed.
impl fmt::Debug for CookieJar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.cookies.keys()).finish()
    }
}

/// Transport seam between the scraping logic and the portal.
pub trait ApiClient {
    fn http_get(
        &self,
        path: &str,
        query_string: &[(String, String)],
        cookies: &CookieJar,
    ) -> Result<PortalResponse, anyhow::Error>;

    fn http_post_form(
        &self,
        path: &str,
        form: &[(String, String)],
        cookies: &CookieJar,
    ) -> Result<PortalResponse, anyhow::Error>;
}

#[derive(Debug)]
pub struct EstPortal {
    base_url: String,
    timeout: Duration,
    http_client: reqwest::blocking::Client,
}

impl EstPortal {
    pub fn new() -> anyhow::Result<Self> {
        Self::build(PRODUCTION_BASE_URL.to_string(), DEFAULT_TIMEOUT)
    }

    /// Uses `EST_BASE_URL` when set, the production portal otherwise.
    pub fn from_env_values() -> anyhow::Result<Self> {
        match std::env::var("EST_BASE_URL") {
            Ok(base_url) => Self::new()?.with_base_url(base_url),
            Err(_) => Self::new(),
        }
    }

    pub fn with_base_url(self, base_url: String) -> anyhow::Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        Self::build(base_url, self.timeout)
    }

    pub fn with_timeout(self, timeout: Duration) -> anyhow::Result<Self> {
        Self::build(self.base_url, timeout)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build(base_url: String, timeout: Duration) -> anyhow::Result<Self> {
        // Redirects are followed by hand so every Set-Cookie along the way is kept.
        let http_client = reqwest::blocking::Client::builder()
            .redirect(Policy::none())
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building HTTP client")?;

        Ok(EstPortal {
            base_url,
            timeout,
            http_client,
        })
    }

    fn send(
        &self,
        request: reqwest::blocking::RequestBuilder,
        cookies: &CookieJar,
    ) -> Result<PortalResponse, anyhow::Error> {
        let mut jar = cookies.clone();
        let mut set_cookies = CookieJar::default();
        let mut response = with_cookies(request, &jar).send()?;
        // Cookies are only exchanged with the host the chain started on.
        let origin = response.url().origin();
        let mut redirects = 0;

        loop {
            let received: Vec<(String, Option<String>)> = response
                .cookies()
                .map(|c| {
                    let expired = c.max_age() == Some(Duration::ZERO)
                        || c.expires().is_some_and(|at| at <= SystemTime::now());
                    let value = (!expired).then(|| c.value().to_string());
                    (c.name().to_string(), value)
                })
                .collect();

            if response.url().origin() == origin {
                for (name, value) in received {
                    match value {
                        Some(value) => {
                            jar.insert(name.clone(), value.clone());
                            set_cookies.insert(name, value);
                        }
                        None => {
                            jar.expire(name.clone());
                            set_cookies.expire(name);
                        }
                    }
                }
            } else if !received.is_empty() {
                debug!(host = ?response.url().host_str(), "ignoring cookies from another host");
            }

            if !is_followed_redirect(response.status()) {
                break;
            }
            if redirects == MAX_REDIRECTS {
                bail!("more than {} redirects from {}", MAX_REDIRECTS, response.url());
            }
            redirects += 1;

            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| anyhow!("redirect from {} without a location", response.url()))?;
            let next = response.url().join(location)?;
            debug!(status = response.status().as_u16(), to = next.path(), "following redirect");

            let same_origin = next.origin() == origin;
            let request = self.http_client.get(next);
            response = if same_origin {
                with_cookies(request, &jar).send()?
            } else {
                request.send()?
            };
        }

        let status = response.status().as_u16();
        let url = response.url();
        let final_path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };
        let body = response.text()?;
        debug!(status, path = %final_path, bytes = body.len(), "portal response");

        Ok(PortalResponse {
            status,
            final_path,
            set_cookies,
            body,
        })
    }
}

/// 300 and 304 carry no location to follow.
fn is_followed_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

fn with_cookies(
    request: reqwest::blocking::RequestBuilder,
    jar: &CookieJar,
) -> reqwest::blocking::RequestBuilder {
    if jar.is_empty() {
        request
    } else {
        request.header(COOKIE, jar.header_value())
    }
}

impl ApiClient for EstPortal {
    fn http_get(
        &self,
        path: &str,
        query_string: &[(String, String)],
        cookies: &CookieJar,
    ) -> Result<PortalResponse, anyhow::Error> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, params = ?query_string, "GET");

        let request = self.http_client.get(&url).query(&query_string);
        self.send(request, cookies)
            .with_context(|| format!("GET {}", url))
    }

    fn http_post_form(
        &self,
        path: &str,
        form: &[(String, String)],
        cookies: &CookieJar,
    ) -> Result<PortalResponse, anyhow::Error> {
        let url = format!("{}{}", self.base_url, path);
        // Form values include the password; only field names are logged.
        let fields: Vec<&str> = form.iter().map(|(k, _)| k.as_str()).collect();
        debug!(url = %url, ?fields, "POST");

        let request = self.http_client.post(&url).form(&form);
        self.send(request, cookies)
            .with_context(|| format!("POST {}", url))
    }
}

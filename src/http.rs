use crate::config::{self, ConfigStore};
use crate::error::{DcosError, Result};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, AUTHORIZATION, LOCATION};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use std::error::Error as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use url::Url;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ATTEMPTS: usize = 3;
const MAX_REDIRECTS: usize = 10;
const DEFAULT_BACKOFF: Duration = Duration::from_millis(250);

pub const SSL_HINT: &str = "An SSL error occurred. To configure your SSL settings, please run: \
`dcos config set core.ssl_verify <value>`";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsTrust {
    System,
    Insecure,
    CaBundle(PathBuf),
}

impl TlsTrust {
    /// Trust for `url` as configured by `core.ssl_verify`. Plain http never verifies.
    pub fn from_config(store: &ConfigStore, url: &Url) -> Self {
        if url.scheme() == "http" {
            return TlsTrust::Insecure;
        }
        match store.value(config::SSL_VERIFY) {
            Some(toml::Value::Boolean(false)) => TlsTrust::Insecure,
            Some(toml::Value::String(raw)) => match raw.trim().to_ascii_lowercase().as_str() {
                "false" => TlsTrust::Insecure,
                "true" | "" => TlsTrust::System,
                _ => TlsTrust::CaBundle(PathBuf::from(raw.trim())),
            },
            _ => TlsTrust::System,
        }
    }

    pub fn is_insecure(&self) -> bool {
        matches!(self, TlsTrust::Insecure)
    }
}

/// Invoked once when a token-bearing request gets a 401; returns the fresh token.
pub trait Reauthenticate: Sync {
    fn reauthenticate(&self) -> Result<String>;
}

fn user_agent() -> String {
    format!("dcos-cli/{} ({})", env!("CARGO_PKG_VERSION"), std::env::consts::OS)
}

fn load_ca_bundle(path: &Path) -> Result<Vec<reqwest::Certificate>> {
    let content = fs::read(path).map_err(|err| {
        DcosError::Config(format!(
            "couldn't read CA bundle {} from core.ssl_verify: {err}",
            path.display()
        ))
    })?;
    let mut certs = Vec::new();
    for pem in x509_parser::pem::Pem::iter_from_buffer(&content) {
        let pem = pem.map_err(|err| {
            DcosError::Config(format!("invalid PEM in {}: {err}", path.display()))
        })?;
        if pem.label != "CERTIFICATE" {
            continue;
        }
        certs.push(reqwest::Certificate::from_der(&pem.contents)?);
    }
    if certs.is_empty() {
        return Err(DcosError::Config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

pub fn build_client(tls: &TlsTrust) -> Result<Client> {
    let mut builder = Client::builder()
        .user_agent(user_agent())
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(None)
        .redirect(reqwest::redirect::Policy::none());
    match tls {
        TlsTrust::System => {}
        TlsTrust::Insecure => builder = builder.danger_accept_invalid_certs(true),
        TlsTrust::CaBundle(path) => {
            builder = builder.tls_built_in_root_certs(false);
            for cert in load_ca_bundle(path)? {
                builder = builder.add_root_certificate(cert);
            }
        }
    }
    Ok(builder.build()?)
}

pub fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port_or_known_default() == b.port_or_known_default()
}

/// True when a rustls error sits anywhere in the source chain. hyper hands TLS
/// failures over as `io::Error` wrapping the rustls error, whose own `source()` skips it.
pub fn is_tls_error(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = Some(err);
    while let Some(current) = source {
        if current.downcast_ref::<rustls::Error>().is_some() {
            return true;
        }
        if let Some(io) = current.downcast_ref::<std::io::Error>() {
            if io
                .get_ref()
                .is_some_and(|inner| inner.downcast_ref::<rustls::Error>().is_some())
            {
                return true;
            }
        }
        source = current.source();
    }
    false
}

pub fn transport_error(url: &Url, err: &reqwest::Error) -> DcosError {
    let detail = {
        let mut parts = vec![err.to_string()];
        let mut source = err.source();
        while let Some(current) = source {
            parts.push(current.to_string());
            source = current.source();
        }
        parts.join(": ")
    };
    let message = if is_tls_error(err) {
        format!("{SSL_HINT}\n{url}: {detail}")
    } else if err.is_timeout() {
        format!("request to {url} timed out: {detail}")
    } else {
        format!("couldn't reach {url}: {detail}")
    };
    DcosError::Transport {
        url: url.to_string(),
        message,
    }
}

/// Pulls the server's message out of a structured error body.
pub fn remote_message(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<serde_json::Value>(body) {
        for field in ["description", "message", "title", "error"] {
            if let Some(text) = payload.get(field).and_then(|v| v.as_str()) {
                if !text.trim().is_empty() {
                    return text.trim().to_string();
                }
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("unexpected response")
            .to_string()
    } else {
        trimmed.chars().take(512).collect()
    }
}

fn is_idempotent(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// `None` disables the deadline (downloads).
    pub timeout: Option<Duration>,
}

/// Cluster-bound client: attaches the token to same-origin requests only.
pub struct HttpClient<'a> {
    base_url: Url,
    token: Mutex<Option<String>>,
    inner: Client,
    timeout: Duration,
    reauth: Option<&'a dyn Reauthenticate>,
    backoff: Duration,
}

impl<'a> HttpClient<'a> {
    pub fn new(base_url: Url, tls: &TlsTrust) -> Result<Self> {
        Ok(HttpClient {
            base_url,
            token: Mutex::new(None),
            inner: build_client(tls)?,
            timeout: DEFAULT_TIMEOUT,
            reauth: None,
            backoff: DEFAULT_BACKOFF,
        })
    }

    /// Client for the cluster described by `store`.
    pub fn from_config(store: &ConfigStore) -> Result<Self> {
        let base_url = store.dcos_url()?;
        let tls = TlsTrust::from_config(store, &base_url);
        let client = HttpClient::new(base_url, &tls)?.with_token(store.acs_token());
        Ok(match store.timeout() {
            Some(timeout) => client.with_timeout(timeout),
            None => client,
        })
    }

    pub fn with_token(self, token: Option<String>) -> Self {
        if let Ok(mut slot) = self.token.lock() {
            *slot = token;
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_reauth(mut self, reauth: &'a dyn Reauthenticate) -> Self {
        self.reauth = Some(reauth);
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn token(&self) -> Option<String> {
        self.token.lock().ok().and_then(|t| t.clone())
    }

    pub fn set_token(&self, token: Option<String>) {
        if let Ok(mut slot) = self.token.lock() {
            *slot = token;
        }
    }

    /// Resolves a cluster-relative path (`/metadata`) or passes an absolute URL through.
    pub fn url(&self, path: &str) -> Result<Url> {
        if path.starts_with("http://") || path.starts_with("https://") {
            return Url::parse(path)
                .map_err(|err| DcosError::Config(format!("invalid url '{path}': {err}")));
        }
        let base = self.base_url.as_str().trim_end_matches('/');
        let joined = format!("{base}/{}", path.trim_start_matches('/'));
        Url::parse(&joined).map_err(|err| DcosError::Config(format!("invalid url '{joined}': {err}")))
    }

    pub fn request(&self, method: Method, path: &str) -> Result<Request> {
        Ok(Request {
            method,
            url: self.url(path)?,
            headers: Vec::new(),
            body: None,
            timeout: Some(self.timeout),
        })
    }

    fn builder(&self, method: &Method, url: &Url, request: &Request) -> RequestBuilder {
        let mut builder = self.inner.request(method.clone(), url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if same_origin(url, &self.base_url) {
            if let Some(token) = self.token() {
                builder = builder.header(AUTHORIZATION, format!("token={token}"));
            }
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        builder
    }

    /// One logical request: redirects followed by hand so the token is re-decided per hop.
    fn send_following(&self, request: &Request) -> Result<Response> {
        let mut method = request.method.clone();
        let mut url = request.url.clone();
        let mut body = request.body.clone();
        let mut hops = 0;
        loop {
            let mut builder = self.builder(&method, &url, request);
            if let Some(bytes) = &body {
                builder = builder.body(bytes.clone());
            }
            let response = builder.send().map_err(|err| transport_error(&url, &err))?;
            let status = response.status();
            if !status.is_redirection() {
                return Ok(response);
            }
            let Some(location) = redirect_target(&url, response.headers()) else {
                return Ok(response);
            };
            if hops == MAX_REDIRECTS {
                break;
            }
            hops += 1;
            tracing::debug!("{} {} redirected to {}", method, url, location);
            if status == StatusCode::SEE_OTHER
                || ((status == StatusCode::MOVED_PERMANENTLY || status == StatusCode::FOUND)
                    && method == Method::POST)
            {
                method = Method::GET;
                body = None;
            }
            url = location;
        }
        Err(DcosError::Transport {
            url: request.url.to_string(),
            message: format!("too many redirects for {}", request.url),
        })
    }

    /// Sends with bounded retries for idempotent verbs and one re-auth on 401.
    /// The final response is returned whatever its status.
    pub fn execute(&self, request: &Request) -> Result<Response> {
        let idempotent = is_idempotent(&request.method);
        let mut reauthenticated = false;
        let mut attempt = 0;
        loop {
            attempt += 1;
            tracing::debug!("{} {} (attempt {attempt})", request.method, request.url);
            let response = match self.send_following(request) {
                Ok(response) => response,
                Err(DcosError::Transport { url, message })
                    if idempotent
                        && attempt < MAX_ATTEMPTS
                        && !message.starts_with(SSL_HINT) =>
                {
                    tracing::info!("retrying {url}: {message}");
                    self.sleep_backoff(attempt);
                    continue;
                }
                Err(err) => return Err(err),
            };
            let status = response.status();
            if status == StatusCode::UNAUTHORIZED
                && !reauthenticated
                && self.token().is_some()
                && same_origin(&request.url, &self.base_url)
            {
                if let Some(reauth) = self.reauth {
                    tracing::info!("token rejected by {}, re-authenticating", request.url);
                    let token = reauth.reauthenticate()?;
                    self.set_token(Some(token));
                    reauthenticated = true;
                    continue;
                }
            }
            if status.is_server_error() && idempotent && attempt < MAX_ATTEMPTS {
                tracing::info!("{} returned {status}, retrying", request.url);
                self.sleep_backoff(attempt);
                continue;
            }
            if status == StatusCode::UNAUTHORIZED && reauthenticated {
                return Err(DcosError::Auth(format!(
                    "authentication failed for {} after logging in again",
                    request.url
                )));
            }
            return Ok(response);
        }
    }

    fn sleep_backoff(&self, attempt: usize) {
        let factor = 1u32 << (attempt.saturating_sub(1).min(6) as u32);
        thread::sleep(self.backoff * factor);
    }

    /// Like `execute`, but any non-2xx status becomes an error.
    pub fn send(&self, request: &Request) -> Result<Response> {
        let response = self.execute(request)?;
        check_status(response)
    }

    pub fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let mut request = self.request(Method::GET, path)?;
        request
            .headers
            .push(("Accept".to_string(), "application/json".to_string()));
        let response = self.send(&request)?;
        Ok(response.json()?)
    }

    pub fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        payload: &serde_json::Value,
        content_type: &str,
        accept: &str,
    ) -> Result<T> {
        let mut request = self.request(Method::POST, path)?;
        request
            .headers
            .push(("Content-Type".to_string(), content_type.to_string()));
        request.headers.push(("Accept".to_string(), accept.to_string()));
        request.body = Some(serde_json::to_vec(payload)?);
        let response = self.send(&request)?;
        Ok(response.json()?)
    }
}

fn redirect_target(current: &Url, headers: &HeaderMap) -> Option<Url> {
    let location = headers.get(LOCATION)?.to_str().ok()?;
    current.join(location).ok()
}

pub fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    let message = remote_message(status, &body);
    if status == StatusCode::UNAUTHORIZED {
        return Err(DcosError::Auth(format!(
            "Authentication failed ({message}). Please run `dcos auth login`"
        )));
    }
    Err(DcosError::Remote {
        status: status.as_u16(),
        message,
    })
}

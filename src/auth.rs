use crate::error::{DcosError, Result};
use crate::http::{remote_message, HttpClient};
use clap::Args;
use dialoguer::console::Term;
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, Input, Password};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io::IsTerminal;
use std::path::PathBuf;

pub const PROVIDERS_ENDPOINT: &str = "/acs/api/v1/auth/providers";
pub const LOGIN_ENDPOINT: &str = "/acs/api/v1/auth/login";
const CHALLENGE_ENDPOINT: &str = "/pkgpanda/active.buildinfo.full.json";
const MAX_LOGIN_ATTEMPTS: usize = 3;
const SERVICE_TOKEN_TTL_SECS: i64 = 5 * 60;

pub const DCOS_UID_PASSWORD: &str = "dcos-uid-password";
pub const DCOS_UID_SERVICEKEY: &str = "dcos-uid-servicekey";
pub const DCOS_UID_PASSWORD_LDAP: &str = "dcos-uid-password-ldap";
pub const SAML_SP_INITIATED: &str = "saml-sp-initiated";
pub const OIDC_AUTH_CODE_FLOW: &str = "oidc-authorization-code-flow";
pub const OIDC_IMPLICIT_FLOW: &str = "oidc-implicit-flow";

const METHOD_CREDENTIAL: &str = "dcos-credential-post-receive-authtoken";
const METHOD_USER_CREDENTIAL: &str = "dcos-usercredential-post-receive-authtoken";
const METHOD_SERVICE_CREDENTIAL: &str = "dcos-servicecredential-post-receive-authtoken";
const METHOD_BROWSER_TOKEN: &str = "browser-prompt-authtoken";
const METHOD_BROWSER_OIDC_TOKEN: &str = "browser-prompt-oidcidtoken-get-authtoken";

pub const AUTH_DISABLED: &str =
    "This cluster does not require authenticated requests. Skipping login.";

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProviderConfig {
    #[serde(default)]
    pub start_flow_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Provider {
    #[serde(skip)]
    pub id: String,
    #[serde(rename = "authentication-type")]
    pub kind: String,
    #[serde(rename = "client-method", default)]
    pub client_method: String,
    #[serde(default)]
    pub config: ProviderConfig,
    #[serde(default)]
    pub description: String,
}

impl Provider {
    fn default_password() -> Self {
        Provider {
            id: DCOS_UID_PASSWORD.to_string(),
            kind: DCOS_UID_PASSWORD.to_string(),
            client_method: METHOD_USER_CREDENTIAL.to_string(),
            config: ProviderConfig {
                start_flow_url: LOGIN_ENDPOINT.to_string(),
            },
            description: "Default DC/OS login provider".to_string(),
        }
    }

    fn default_oidc() -> Self {
        Provider {
            id: "dcos-oidc-auth0".to_string(),
            kind: OIDC_IMPLICIT_FLOW.to_string(),
            client_method: METHOD_BROWSER_TOKEN.to_string(),
            config: ProviderConfig {
                start_flow_url: "/login?redirect_uri=urn:ietf:wg:oauth:2.0:oob".to_string(),
            },
            description: "Google, GitHub, or Microsoft".to_string(),
        }
    }

    pub fn is_password(&self) -> bool {
        self.kind == DCOS_UID_PASSWORD || self.kind == DCOS_UID_PASSWORD_LDAP
    }

    pub fn is_service_key(&self) -> bool {
        self.kind == DCOS_UID_SERVICEKEY
    }

    /// Human description shown by `auth list-providers` and the provider prompt.
    pub fn login_method(&self) -> String {
        match self.kind.as_str() {
            DCOS_UID_PASSWORD => {
                "Log in using a standard DC/OS user account (username and password)".to_string()
            }
            DCOS_UID_SERVICEKEY => {
                "Log in using a DC/OS service user account (username and private key)".to_string()
            }
            DCOS_UID_PASSWORD_LDAP => {
                "Log in using an LDAP user account (username and password)".to_string()
            }
            SAML_SP_INITIATED => format!("Log in using SAML 2.0 ({})", self.description),
            OIDC_IMPLICIT_FLOW | OIDC_AUTH_CODE_FLOW => {
                format!("Log in using OpenID Connect ({})", self.description)
            }
            _ => self.description.clone(),
        }
    }
}

/// Parses the providers document, keeping the order the cluster advertised.
pub fn parse_providers(payload: serde_json::Value) -> Result<Vec<Provider>> {
    let serde_json::Value::Object(map) = payload else {
        return Err(DcosError::Auth(
            "unexpected login providers document".to_string(),
        ));
    };
    let mut providers = Vec::new();
    for (id, raw) in map {
        let mut provider: Provider = serde_json::from_value(raw)?;
        provider.id = id;
        providers.push(provider);
    }
    Ok(providers)
}

#[derive(Args, Debug, Clone, Default)]
pub struct LoginFlags {
    /// Login provider ID
    #[arg(long = "provider")]
    pub provider: Option<String>,
    #[arg(long)]
    pub username: Option<String>,
    #[arg(long)]
    pub password: Option<String>,
    /// Read the password from this file
    #[arg(long = "password-file")]
    pub password_file: Option<PathBuf>,
    /// Read the password from this environment variable
    #[arg(long = "password-env")]
    pub password_env: Option<String>,
    /// Service account private key (PEM) for service logins
    #[arg(long = "private-key")]
    pub private_key: Option<PathBuf>,
}

#[derive(Clone)]
pub struct Credentials {
    provider: Option<String>,
    username: Option<String>,
    password: Option<String>,
    private_key: Option<EncodingKey>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("provider", &self.provider)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("private_key", &self.private_key.as_ref().map(|_| "***"))
            .finish()
    }
}

impl LoginFlags {
    /// Resolves password sources in order: file, env var, plain flag.
    pub fn resolve(&self) -> Result<Credentials> {
        let password = if let Some(path) = &self.password_file {
            let content = fs::read_to_string(path).map_err(|err| {
                DcosError::Auth(format!(
                    "couldn't read password from '{}': {err}",
                    path.display()
                ))
            })?;
            Some(content.trim_end().to_string())
        } else if let Some(var) = &self.password_env {
            match env::var(var) {
                Ok(value) if !value.is_empty() => Some(value),
                _ => {
                    return Err(DcosError::Auth(format!(
                        "couldn't read password from '{var}' env var"
                    )))
                }
            }
        } else {
            self.password.clone()
        };
        let private_key = match &self.private_key {
            Some(path) => {
                let pem = fs::read(path).map_err(|err| {
                    DcosError::Auth(format!(
                        "couldn't read private key '{}': {err}",
                        path.display()
                    ))
                })?;
                Some(EncodingKey::from_rsa_pem(&pem).map_err(|err| {
                    DcosError::Auth(format!(
                        "couldn't parse private key '{}': {err}",
                        path.display()
                    ))
                })?)
            }
            None => None,
        };
        Ok(Credentials {
            provider: self.provider.clone(),
            username: self.username.clone().filter(|u| !u.is_empty()),
            password,
            private_key,
        })
    }
}

/// Operator interaction used by login and setup.
pub trait Prompter: Sync {
    fn interactive(&self) -> bool;
    fn input(&self, label: &str) -> Result<String>;
    fn password(&self, label: &str) -> Result<String>;
    fn confirm(&self, label: &str) -> Result<bool>;
}

pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn interactive(&self) -> bool {
        std::io::stdin().is_terminal()
    }

    fn input(&self, label: &str) -> Result<String> {
        Ok(Input::<String>::with_theme(&ColorfulTheme::default())
            .with_prompt(label)
            .interact_text_on(&Term::stderr())?)
    }

    fn password(&self, label: &str) -> Result<String> {
        Ok(Password::with_theme(&ColorfulTheme::default())
            .with_prompt(label)
            .interact_on(&Term::stderr())?)
    }

    fn confirm(&self, label: &str) -> Result<bool> {
        Ok(Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(label)
            .default(false)
            .interact_on(&Term::stderr())?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    Unconfigured,
    Probing,
    ChoosingProvider,
    CollectingCredentials,
    Exchanging,
    Authenticated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Token(String),
    AuthDisabled,
}

#[derive(Serialize)]
struct ServiceClaims<'a> {
    uid: &'a str,
    exp: i64,
}

pub fn service_token(uid: &str, key: &EncodingKey) -> Result<String> {
    let claims = ServiceClaims {
        uid,
        exp: chrono::Utc::now().timestamp() + SERVICE_TOKEN_TTL_SECS,
    };
    encode(&Header::new(Algorithm::RS256), &claims, key)
        .map_err(|err| DcosError::Auth(format!("couldn't sign service login token: {err}")))
}

pub struct LoginFlow<'c, 'p> {
    client: &'c HttpClient<'c>,
    prompter: &'p dyn Prompter,
    credentials: Credentials,
    state: LoginState,
    prompted: bool,
}

impl<'c, 'p> LoginFlow<'c, 'p> {
    pub fn new(client: &'c HttpClient<'c>, prompter: &'p dyn Prompter, credentials: Credentials) -> Self {
        LoginFlow {
            client,
            prompter,
            credentials,
            state: LoginState::Unconfigured,
            prompted: false,
        }
    }

    pub fn state(&self) -> LoginState {
        self.state
    }

    fn transition(&mut self, next: LoginState) {
        tracing::debug!("login {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// HEAD on a cluster resource without credentials: 200 means auth is off,
    /// 401 carries the WWW-Authenticate scheme.
    fn challenge(&self, token: Option<&str>) -> Result<(StatusCode, String)> {
        let mut request = self.client.request(Method::HEAD, CHALLENGE_ENDPOINT)?;
        if let Some(token) = token {
            request
                .headers
                .push(("Authorization".to_string(), format!("token={token}")));
        }
        let response = self.client.execute(&request)?;
        let scheme = response
            .headers()
            .get("www-authenticate")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .trim()
            .to_string();
        Ok((response.status(), scheme))
    }

    pub fn providers(&self) -> Result<Option<Vec<Provider>>> {
        let (status, scheme) = self.challenge(None)?;
        match status.as_u16() {
            200 => return Ok(None),
            401 => {}
            other => {
                return Err(DcosError::Auth(format!(
                    "expected status code 401, got {other}"
                )))
            }
        }
        let request = self.client.request(Method::GET, PROVIDERS_ENDPOINT)?;
        let response = self.client.execute(&request)?;
        if response.status().is_success() {
            let mut providers = parse_providers(response.json()?)?;
            if scheme == "oauthjwt" && !providers.iter().any(|p| p.id == "dcos-oidc-auth0") {
                providers.push(Provider::default_oidc());
            }
            return Ok(Some(providers));
        }
        tracing::info!("falling back to the WWW-Authenticate challenge");
        match scheme.as_str() {
            "oauthjwt" => Ok(Some(vec![Provider::default_oidc()])),
            "acsjwt" => Ok(Some(vec![Provider::default_password()])),
            other => Err(DcosError::Auth(format!(
                "unsupported WWW-Authenticate challenge '{other}'"
            ))),
        }
    }

    pub fn select_provider(&self, providers: &[Provider]) -> Result<Provider> {
        if let Some(id) = &self.credentials.provider {
            return providers
                .iter()
                .find(|p| &p.id == id)
                .cloned()
                .ok_or_else(|| DcosError::Auth(format!("unknown login provider ID '{id}'")));
        }
        let with_key = self.credentials.private_key.is_some();
        let candidates: Vec<&Provider> = providers
            .iter()
            .filter(|p| {
                let supported = p.is_service_key() == with_key;
                if !supported {
                    tracing::info!("excluding provider '{}' based on command-line flags", p.id);
                }
                supported
            })
            .collect();
        let chosen = if with_key {
            candidates.first().copied()
        } else if self.credentials.username.is_some() {
            candidates
                .iter()
                .find(|p| p.is_password())
                .or_else(|| candidates.first())
                .copied()
        } else {
            candidates.first().copied()
        };
        chosen
            .cloned()
            .ok_or_else(|| DcosError::Auth("couldn't determine a login provider".to_string()))
    }

    fn uid(&mut self) -> Result<String> {
        if let Some(username) = &self.credentials.username {
            return Ok(username.clone());
        }
        self.require_interactive("--username")?;
        self.prompted = true;
        self.prompter.input("Username")
    }

    fn password(&mut self) -> Result<String> {
        if let Some(password) = &self.credentials.password {
            return Ok(password.clone());
        }
        self.require_interactive("--password, --password-env or --password-file")?;
        self.prompted = true;
        self.prompter.password("Password")
    }

    fn require_interactive(&self, flags: &str) -> Result<()> {
        if self.prompter.interactive() {
            Ok(())
        } else {
            Err(DcosError::Auth(format!(
                "missing credentials for a non-interactive login, please pass {flags}"
            )))
        }
    }

    fn exchange(&self, endpoint: &str, body: serde_json::Value) -> Result<String> {
        let endpoint = if endpoint.is_empty() {
            LOGIN_ENDPOINT
        } else {
            endpoint
        };
        let mut request = self.client.request(Method::POST, endpoint)?;
        request
            .headers
            .push(("Content-Type".to_string(), "application/json".to_string()));
        request.body = Some(serde_json::to_vec(&body)?);
        let response = self.client.execute(&request)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(DcosError::Auth(format!(
                "couldn't log in: {}",
                remote_message(status, &text)
            )));
        }
        let payload: serde_json::Value = response.json()?;
        payload
            .get("token")
            .and_then(|t| t.as_str())
            .map(str::to_string)
            .ok_or_else(|| DcosError::Auth("login response carried no token".to_string()))
    }

    fn login_once(&mut self, provider: &Provider, attempt: usize) -> Result<String> {
        self.transition(LoginState::CollectingCredentials);
        let method = if provider.client_method.is_empty() {
            match provider.kind.as_str() {
                DCOS_UID_SERVICEKEY => METHOD_SERVICE_CREDENTIAL,
                DCOS_UID_PASSWORD | DCOS_UID_PASSWORD_LDAP => METHOD_USER_CREDENTIAL,
                _ => METHOD_BROWSER_TOKEN,
            }
        } else {
            provider.client_method.as_str()
        };
        match method {
            METHOD_CREDENTIAL | METHOD_USER_CREDENTIAL => {
                let uid = self.uid()?;
                let password = self.password()?;
                self.transition(LoginState::Exchanging);
                self.exchange(
                    &provider.config.start_flow_url,
                    serde_json::json!({"uid": uid, "password": password}),
                )
            }
            METHOD_SERVICE_CREDENTIAL => {
                let uid = self.uid()?;
                let key = self.credentials.private_key.clone().ok_or_else(|| {
                    DcosError::Auth("the service login requires --private-key".to_string())
                })?;
                let token = service_token(&uid, &key)?;
                self.transition(LoginState::Exchanging);
                self.exchange(LOGIN_ENDPOINT, serde_json::json!({"uid": uid, "token": token}))
            }
            METHOD_BROWSER_TOKEN | METHOD_BROWSER_OIDC_TOKEN => {
                self.require_interactive("a token from a browser login")?;
                if attempt == 1 {
                    let start = self.client.url(&provider.config.start_flow_url)?;
                    eprintln!(
                        "If your browser didn't open, please follow this link:\n\n    {start}\n"
                    );
                }
                self.prompted = true;
                let token = self.prompter.input("Enter token from the browser")?;
                self.transition(LoginState::Exchanging);
                if method == METHOD_BROWSER_OIDC_TOKEN {
                    return self.exchange(LOGIN_ENDPOINT, serde_json::json!({"token": token}));
                }
                let (status, _) = self.challenge(Some(&token))?;
                match status.as_u16() {
                    200 | 403 => Ok(token),
                    401 => Err(DcosError::Auth("invalid auth token".to_string())),
                    other => Err(DcosError::Auth(format!("unexpected status code {other}"))),
                }
            }
            other => Err(DcosError::Auth(format!(
                "login method '{other}' of provider '{}' is not supported",
                provider.id
            ))),
        }
    }

    /// Runs the flow to completion. Nothing is written to disk here.
    pub fn run(&mut self) -> Result<LoginOutcome> {
        self.transition(LoginState::Probing);
        let Some(providers) = self.providers()? else {
            self.transition(LoginState::Unconfigured);
            return Ok(LoginOutcome::AuthDisabled);
        };
        self.transition(LoginState::ChoosingProvider);
        let provider = self.select_provider(&providers)?;
        tracing::info!("using login provider '{}'", provider.id);

        let mut attempt = 1;
        loop {
            match self.login_once(&provider, attempt) {
                Ok(token) => {
                    self.transition(LoginState::Authenticated);
                    return Ok(LoginOutcome::Token(token));
                }
                Err(err) if self.prompted && attempt < MAX_LOGIN_ATTEMPTS => {
                    eprintln!("Error: {err}");
                    attempt += 1;
                }
                Err(err) => {
                    self.transition(LoginState::Unconfigured);
                    return Err(err);
                }
            }
        }
    }
}

use crate::auth::{LoginFlags, LoginFlow, LoginOutcome, Prompter, AUTH_DISABLED};
use crate::cluster::{validate_cluster_id, Cluster, Registry, CA_FILE, CONFIG_FILE, PLUGINS_DIR};
use crate::config::{self, validate_url, ConfigFile};
use crate::error::{DcosError, Result};
use crate::fsutil::{remove_path, write_atomic};
use crate::http::{HttpClient, TlsTrust, SSL_HINT};
use crate::package::{self, Artifact, PackageClient};
use crate::plugin::{InstallOptions, PluginStore, Source};
use clap::Args;
use reqwest::Method;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
pub const METADATA_TIMEOUT: Duration = Duration::from_secs(3);
const CA_ENDPOINT: &str = "/ca/dcos-ca.crt";
pub const CORE_PLUGIN: &str = "dcos-core-cli";
pub const ENTERPRISE_PLUGIN: &str = "dcos-enterprise-cli";

#[derive(Args, Debug, Clone, Default)]
pub struct SetupArgs {
    /// URL of the cluster to set up
    pub url: String,
    /// Name for the cluster (defaults to the name the cluster reports)
    #[arg(long)]
    pub name: Option<String>,
    /// Skip TLS verification for this cluster
    #[arg(long, conflicts_with = "ca_certs")]
    pub insecure: bool,
    /// Trust the certificate authorities in this PEM file
    #[arg(long = "ca-certs", alias = "ca-bundle")]
    pub ca_certs: Option<PathBuf>,
    /// Trust the downloaded cluster CA without asking
    #[arg(long = "no-check")]
    pub no_check: bool,
    /// Disable the request timeouts of the setup probes
    #[arg(long = "no-timeout")]
    pub no_timeout: bool,
    #[command(flatten)]
    pub login: LoginFlags,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    #[serde(rename = "CLUSTER_ID", default)]
    cluster_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DcosVersion {
    #[serde(default)]
    pub version: String,
    #[serde(rename = "dcos-variant", default)]
    pub variant: String,
    #[serde(rename = "dcos-image-commit", default)]
    pub commit: String,
    #[serde(rename = "bootstrap-id", default)]
    pub bootstrap_id: String,
}

#[derive(Debug, Deserialize)]
struct StateSummary {
    #[serde(default)]
    cluster: String,
}

pub fn fetch_cluster_id(http: &HttpClient<'_>) -> Result<String> {
    let metadata: Metadata = http.get_json("/metadata")?;
    if metadata.cluster_id.is_empty() {
        return Err(DcosError::Integrity(format!(
            "{}/metadata carries no CLUSTER_ID",
            http.base_url().as_str().trim_end_matches('/')
        )));
    }
    validate_cluster_id(&metadata.cluster_id)?;
    Ok(metadata.cluster_id)
}

pub fn fetch_version(http: &HttpClient<'_>) -> Result<DcosVersion> {
    http.get_json("/dcos-metadata/dcos-version.json")
}

/// `https://` is assumed when the scheme is missing; trailing slashes are dropped.
pub fn normalize_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(DcosError::Usage("a cluster URL is required".to_string()));
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        let assumed = format!("https://{trimmed}");
        tracing::warn!("no scheme given, using {assumed}");
        assumed
    };
    validate_url(&with_scheme)
}

/// Trimmed URL string as stored in `core.dcos_url`.
fn url_text(url: &Url) -> String {
    url.as_str().trim_end_matches('/').to_string()
}

/// Issuer, validity and fingerprint of the first certificate in a PEM bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaSummary {
    pub issuer: String,
    pub not_before: String,
    pub not_after: String,
    pub fingerprint: String,
}

pub fn fingerprint(der: &[u8]) -> String {
    Sha256::digest(der)
        .iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

pub fn summarize_ca(pem_bytes: &[u8]) -> Result<CaSummary> {
    for pem in x509_parser::pem::Pem::iter_from_buffer(pem_bytes) {
        let pem = pem
            .map_err(|err| DcosError::Integrity(format!("invalid cluster CA bundle: {err}")))?;
        if pem.label != "CERTIFICATE" {
            continue;
        }
        let cert = pem
            .parse_x509()
            .map_err(|err| DcosError::Integrity(format!("invalid cluster CA certificate: {err}")))?;
        let when = |ts: i64| {
            chrono::DateTime::from_timestamp(ts, 0)
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| ts.to_string())
        };
        return Ok(CaSummary {
            issuer: cert.issuer().to_string(),
            not_before: when(cert.validity().not_before.timestamp()),
            not_after: when(cert.validity().not_after.timestamp()),
            fingerprint: fingerprint(&pem.contents),
        });
    }
    Err(DcosError::Integrity(
        "the cluster CA bundle contains no certificate".to_string(),
    ))
}

fn ca_prompt(summary: &CaSummary) -> String {
    format!(
        "Cluster Certificate Authority:\n\n  Issuer: {}\n\n  Validity:\n    From:  {}\n    Until: {}\n\n  SHA256 fingerprint: {}\n",
        summary.issuer, summary.not_before, summary.not_after, summary.fingerprint
    )
}

type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

pub struct Setup<'a> {
    registry: &'a Registry,
    prompter: &'a dyn Prompter,
    env: EnvLookup<'a>,
}

/// What a finished setup reports to the operator.
#[derive(Debug)]
pub struct SetupReport {
    pub cluster: Cluster,
    pub url: String,
    pub new_commands: Vec<String>,
}

impl<'a> Setup<'a> {
    pub fn new(registry: &'a Registry, prompter: &'a dyn Prompter, env: EnvLookup<'a>) -> Self {
        Setup {
            registry,
            prompter,
            env,
        }
    }

    fn env_flag(&self, name: &str) -> bool {
        (self.env)(name).map(|v| v.trim() == "1").unwrap_or(false)
    }

    fn client<'c>(&self, url: &Url, trust: &TlsTrust, args: &SetupArgs) -> Result<HttpClient<'c>> {
        let client = HttpClient::new(url.clone(), trust)?;
        Ok(if args.no_timeout {
            client
        } else {
            client.with_timeout(PROBE_TIMEOUT)
        })
    }

    /// HEAD on the root; returns the URL the cluster answers under.
    fn probe(&self, url: &Url, trust: &TlsTrust, args: &SetupArgs) -> Result<Url> {
        let client = self.client(url, trust, args)?;
        let request = client.request(Method::HEAD, "/")?;
        let response = client.execute(&request)?;
        if !response.status().is_success() {
            return Err(DcosError::State(format!(
                "couldn't detect a canonical cluster URL for {url} (HTTP {})",
                response.status().as_u16()
            )));
        }
        if response.url() == &request.url {
            return Ok(url.clone());
        }
        let mut answered = response.url().clone();
        answered.set_query(None);
        answered.set_fragment(None);
        let canonical = normalize_url(answered.as_str())?;
        if url_text(&canonical) != url_text(url) {
            eprintln!("Continuing cluster setup with: {}", url_text(&canonical));
        }
        Ok(canonical)
    }

    fn download_ca(&self, url: &Url, args: &SetupArgs) -> Result<Vec<u8>> {
        let client = self.client(url, &TlsTrust::Insecure, args)?;
        let request = client.request(Method::GET, CA_ENDPOINT)?;
        Ok(client.send(&request)?.bytes()?.to_vec())
    }

    fn confirm_ca(&self, pem: &[u8], args: &SetupArgs) -> Result<()> {
        let summary = summarize_ca(pem)?;
        if args.no_check {
            tracing::info!("trusting cluster CA {} without confirmation", summary.fingerprint);
            return Ok(());
        }
        if !self.prompter.interactive() {
            return Err(DcosError::State(
                "the cluster certificate authority must be confirmed; pass --no-check, --ca-certs or --insecure"
                    .to_string(),
            ));
        }
        eprintln!("{}", ca_prompt(&summary));
        if self.prompter.confirm("Do you trust it?")? {
            Ok(())
        } else {
            Err(DcosError::State(
                "the cluster certificate authority was not trusted".to_string(),
            ))
        }
    }

    /// Resolves trust for the cluster; `ca_pem` is the bundle to store with it.
    fn establish_trust(
        &self,
        url: &Url,
        args: &SetupArgs,
        staging: &Path,
    ) -> Result<(Url, TlsTrust, Option<Vec<u8>>)> {
        if args.insecure || url.scheme() == "http" {
            let url = self.probe(url, &TlsTrust::Insecure, args)?;
            return Ok((url, TlsTrust::Insecure, None));
        }
        let staged_ca = staging.join(CA_FILE);
        if let Some(path) = &args.ca_certs {
            let pem = fs::read(path).map_err(|err| {
                DcosError::Config(format!("couldn't read {}: {err}", path.display()))
            })?;
            summarize_ca(&pem)?;
            write_atomic(&staged_ca, &pem, Some(0o644))?;
            let trust = TlsTrust::CaBundle(staged_ca);
            let url = self.probe(url, &trust, args)?;
            return Ok((url, trust, Some(pem)));
        }
        match self.probe(url, &TlsTrust::System, args) {
            Ok(url) => Ok((url, TlsTrust::System, None)),
            Err(DcosError::Transport { message, .. }) if message.starts_with(SSL_HINT) => {
                tracing::info!("cluster certificate is not trusted, downloading {CA_ENDPOINT}");
                let pem = self.download_ca(url, args)?;
                self.confirm_ca(&pem, args)?;
                write_atomic(&staged_ca, &pem, Some(0o644))?;
                let trust = TlsTrust::CaBundle(staged_ca);
                let url = self.probe(url, &trust, args)?;
                Ok((url, trust, Some(pem)))
            }
            Err(err) => Err(err),
        }
    }

    fn acquire_token(&self, client: &HttpClient<'_>, args: &SetupArgs) -> Result<Option<String>> {
        if let Some(token) = (self.env)("DCOS_CLUSTER_SETUP_ACS_TOKEN").filter(|t| !t.is_empty()) {
            return Ok(Some(token));
        }
        let credentials = args.login.resolve()?;
        match LoginFlow::new(client, self.prompter, credentials).run()? {
            LoginOutcome::Token(token) => Ok(Some(token)),
            LoginOutcome::AuthDisabled => {
                eprintln!("{AUTH_DISABLED}");
                Ok(None)
            }
        }
    }

    fn cluster_name(&self, client: &HttpClient<'_>, args: &SetupArgs, id: &str) -> String {
        if let Some(name) = args.name.clone().filter(|n| !n.trim().is_empty()) {
            return name;
        }
        match client.get_json::<StateSummary>("/mesos/state-summary") {
            Ok(summary) if !summary.cluster.is_empty() => summary.cluster,
            Ok(_) => id.to_string(),
            Err(err) => {
                tracing::info!("couldn't read the cluster name: {err}");
                id.to_string()
            }
        }
    }

    /// Refuses to silently rename an existing cluster record.
    fn check_existing(&self, id: &str, name: &str) -> Result<()> {
        let existing = self.registry.list()?.into_iter().find(|c| c.id() == id);
        let Some(existing) = existing else {
            return Ok(());
        };
        if existing.name() == name {
            return Ok(());
        }
        let question = format!(
            "Cluster {id} is already configured as '{}'. Replace it with '{name}'?",
            existing.name()
        );
        if self.prompter.interactive() && self.prompter.confirm(&question)? {
            return Ok(());
        }
        Err(DcosError::State(format!(
            "cluster {id} is already configured as '{}'",
            existing.name()
        )))
    }

    fn canonical_artifact(&self, name: &str, version: &str) -> Result<Artifact> {
        let url = package::canonical_url(
            &package::download_base(name),
            name,
            package::host_platform(),
            version,
        )?;
        let origin = Url::parse(&url)
            .map_err(|err| DcosError::Config(format!("invalid download url '{url}': {err}")))?;
        let client = HttpClient::new(origin, &TlsTrust::System)?;
        let sidecar = format!("{url}.sha256");
        let request = client.request(Method::GET, &sidecar)?;
        let text = client.send(&request)?.text()?;
        let sha256 = package::parse_checksum(&text).ok_or_else(|| {
            DcosError::Integrity(format!("invalid checksum file {sidecar}"))
        })?;
        Ok(Artifact {
            name: name.to_string(),
            version: None,
            url: url.clone(),
            kind: None,
            sha256: Some(sha256),
            source: url,
        })
    }

    fn resolve_artifact(&self, client: &HttpClient<'_>, name: &str, version: &str) -> Result<Artifact> {
        if !self.env_flag("DCOS_CLUSTER_SETUP_SKIP_CANONICAL_URL_INSTALL") {
            match self.canonical_artifact(name, version) {
                Ok(artifact) => return Ok(artifact),
                Err(err) => tracing::debug!("canonical download of {name} unavailable: {err}"),
            }
        }
        if self.env_flag("DCOS_CLUSTER_SETUP_SKIP_COSMOS_INSTALL") {
            return Err(DcosError::State(format!(
                "skipping installation of {name} from the package registry (DCOS_CLUSTER_SETUP_SKIP_COSMOS_INSTALL=1)"
            )));
        }
        PackageClient::new(client).artifact(name, None)
    }

    /// Downloads the default plugins concurrently, then installs them one by one.
    fn install_default_plugins(&self, client: &HttpClient<'_>, store: &PluginStore) -> Result<Vec<String>> {
        let version = fetch_version(client).map_err(|err| {
            DcosError::State(format!(
                "unable to get DC/OS version, installation of the plugins aborted: {err}"
            ))
        })?;
        let mut wanted = vec![CORE_PLUGIN];
        if version.variant == "enterprise" {
            wanted.push(ENTERPRISE_PLUGIN);
        }

        let mut foreign = Vec::new();
        let mut artifacts = Vec::new();
        for name in wanted {
            tracing::info!("Installing {name}...");
            match self.resolve_artifact(client, name, &version.version) {
                Ok(artifact) => {
                    let same_origin = Url::parse(&artifact.url)
                        .map(|u| crate::http::same_origin(&u, client.base_url()))
                        .unwrap_or(false);
                    let downloader = if same_origin {
                        None
                    } else {
                        let origin = Url::parse(&artifact.url).map_err(|err| {
                            DcosError::Config(format!("invalid download url '{}': {err}", artifact.url))
                        })?;
                        Some(HttpClient::new(origin, &TlsTrust::System)?)
                    };
                    foreign.push(downloader);
                    artifacts.push(artifact);
                }
                Err(err) if name == CORE_PLUGIN => return Err(err),
                Err(err) => tracing::warn!("skipping {name}: {err}"),
            }
        }

        let jobs: Vec<(&HttpClient<'_>, Artifact)> = foreign
            .iter()
            .zip(artifacts)
            .map(|(downloader, artifact)| (downloader.as_ref().unwrap_or(client), artifact))
            .collect();
        fs::create_dir_all(store.root())?;
        let downloads = package::download_all(&jobs, store.root());

        let mut commands = Vec::new();
        for ((_, artifact), download) in jobs.iter().zip(downloads) {
            let outcome = download.and_then(|download| {
                let options = InstallOptions {
                    name: Some(artifact.name.clone()),
                    update: true,
                    version: artifact.version.clone(),
                    checksum: Some(download.sha256.clone()),
                    kind: artifact.kind,
                    source: Some(artifact.source.clone()),
                };
                let installed = store.install(&Source::Path(download.path.clone()), &options, None);
                if let Some(dir) = download.path.parent() {
                    let _ = remove_path(dir);
                }
                installed
            });
            match outcome {
                Ok(plugin) => commands.extend(plugin.verbs().iter().map(|v| v.to_string())),
                Err(err) if artifact.name == CORE_PLUGIN => return Err(err),
                Err(err) => tracing::warn!("couldn't install {}: {err}", artifact.name),
            }
        }
        commands.sort();
        Ok(commands)
    }

    pub fn run(&self, args: &SetupArgs) -> Result<SetupReport> {
        let url = normalize_url(&args.url)?;
        let staging = self.registry.staging_dir();
        fs::create_dir_all(&staging)?;
        let result = self.run_staged(&url, args, &staging);
        if result.is_err() {
            let _ = remove_path(&staging);
        }
        result
    }

    fn run_staged(&self, url: &Url, args: &SetupArgs, staging: &Path) -> Result<SetupReport> {
        let (url, trust, ca_pem) = self.establish_trust(url, args, staging)?;
        let id = fetch_cluster_id(&self.client(&url, &trust, args)?.with_timeout(METADATA_TIMEOUT))?;
        let client = self.client(&url, &trust, args)?;
        let token = self.acquire_token(&client, args)?;
        let client = client.with_token(token.clone());
        let name = self.cluster_name(&client, args, &id);
        self.check_existing(&id, &name)?;

        let final_dir = self.registry.clusters_dir().join(&id);
        let mut config = ConfigFile::empty(&staging.join(CONFIG_FILE));
        config.set(config::DCOS_URL, toml::Value::String(url_text(&url)));
        config.set(config::CLUSTER_NAME, toml::Value::String(name));
        let ssl_verify = match (&trust, &ca_pem) {
            (TlsTrust::Insecure, _) if args.insecure || url.scheme() == "https" => "false".to_string(),
            (_, Some(_)) => final_dir.join(CA_FILE).display().to_string(),
            _ => "true".to_string(),
        };
        config.set(config::SSL_VERIFY, toml::Value::String(ssl_verify));
        if let Some(token) = &token {
            config.set(config::ACS_TOKEN, toml::Value::String(token.clone()));
        }
        config.save()?;

        let store = PluginStore::new(&staging.join(PLUGINS_DIR), &self.registry.lock_path());
        let new_commands = self.install_default_plugins(&client, &store)?;

        let cluster = self.registry.commit_staged(staging, &id)?;
        Ok(SetupReport {
            cluster,
            url: url_text(&url),
            new_commands,
        })
    }
}

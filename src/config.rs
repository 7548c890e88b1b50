use crate::error::{DcosError, Result};
use crate::fsutil::{write_atomic, FileLock};
use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use toml::{Table, Value};
use url::Url;

pub const DCOS_URL: &str = "core.dcos_url";
pub const ACS_TOKEN: &str = "core.dcos_acs_token";
pub const SSL_VERIFY: &str = "core.ssl_verify";
pub const TIMEOUT: &str = "core.timeout";
pub const PROMPT_LOGIN: &str = "core.prompt_login";
pub const CLUSTER_NAME: &str = "cluster.name";

const TORN_READ_ATTEMPTS: usize = 3;
const CONFIG_FILE_MODE: u32 = 0o600;
const MASK: &str = "********";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    String,
    Secret,
    Bool,
    Integer,
    Url,
    BoolOrPath,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Global,
    Cluster,
}

#[derive(Debug, Clone, Copy)]
pub struct KeySpec {
    pub path: &'static str,
    pub kind: ValueType,
    pub layer: Layer,
}

const fn key(path: &'static str, kind: ValueType, layer: Layer) -> KeySpec {
    KeySpec { path, kind, layer }
}

pub const SCHEMA: &[KeySpec] = &[
    key(DCOS_URL, ValueType::Url, Layer::Cluster),
    key(ACS_TOKEN, ValueType::Secret, Layer::Cluster),
    key(SSL_VERIFY, ValueType::BoolOrPath, Layer::Cluster),
    key(TIMEOUT, ValueType::Integer, Layer::Cluster),
    key("core.ssh_user", ValueType::String, Layer::Cluster),
    key("core.ssh_proxy_ip", ValueType::String, Layer::Cluster),
    key("core.mesos_master_url", ValueType::Url, Layer::Cluster),
    key(PROMPT_LOGIN, ValueType::Bool, Layer::Cluster),
    key("core.pagination", ValueType::Bool, Layer::Global),
    key("core.reporting", ValueType::Bool, Layer::Global),
    key(CLUSTER_NAME, ValueType::String, Layer::Cluster),
    key("marathon.url", ValueType::Url, Layer::Cluster),
    key("package.cosmos_url", ValueType::Url, Layer::Cluster),
    key("job.url", ValueType::Url, Layer::Cluster),
    key("job.service_name", ValueType::String, Layer::Cluster),
];

const DEPRECATED: &[(&str, &str)] = &[
    (
        "core.email",
        "core.email is no longer used; the account is taken from the login provider",
    ),
    (
        "core.dcos_acs_token_expiry",
        "core.dcos_acs_token_expiry is no longer used; run `dcos auth login` when the token expires",
    ),
    (
        "package.sources",
        "package.sources has moved to the cluster; use `dcos package repo add` instead",
    ),
    (
        "package.cache",
        "package.cache is no longer used; package metadata is fetched from the cluster",
    ),
];

/// Sections whose keys are never exported to plugins as DCOS_<SECTION>_<KEY>.
const RESERVED_SECTIONS: &[&str] = &["core", "cluster"];

const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("DCOS_URL", DCOS_URL),
    ("DCOS_DCOS_URL", DCOS_URL),
    ("DCOS_ACS_TOKEN", ACS_TOKEN),
    ("DCOS_SSL_VERIFY", SSL_VERIFY),
    ("DCOS_TIMEOUT", TIMEOUT),
];

pub fn spec_for(path: &str) -> Option<&'static KeySpec> {
    SCHEMA.iter().find(|spec| spec.path == path)
}

fn split_path(path: &str) -> Result<(&str, &str)> {
    match path.split_once('.') {
        Some((section, key)) if !section.is_empty() && !key.is_empty() => Ok((section, key)),
        _ => Err(DcosError::Config(
            "Property name must have both a section and key: <section>.<key> - E.g. marathon.url"
                .to_string(),
        )),
    }
}

pub fn validate_url(raw: &str) -> Result<Url> {
    let missing_scheme = || DcosError::Config(format!("Please check url '{raw}'. Missing http(s)://"));
    let parsed = Url::parse(raw.trim()).map_err(|err| match err {
        url::ParseError::RelativeUrlWithoutBase => missing_scheme(),
        url::ParseError::EmptyHost => {
            DcosError::Config(format!("Please check url '{raw}'. Missing host"))
        }
        other => DcosError::Config(format!("Please check url '{raw}'. {other}")),
    })?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(missing_scheme());
    }
    if parsed.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(DcosError::Config(format!(
            "Please check url '{raw}'. Missing host"
        )));
    }
    if parsed.password().is_some() {
        return Err(DcosError::Config(format!(
            "Please check url '{raw}'. Credentials with ':' are not allowed in the url"
        )));
    }
    Ok(parsed)
}

fn parse_bool(path: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(DcosError::Config(format!(
            "{path} must be a boolean (true or false), got '{raw}'"
        ))),
    }
}

pub fn parse_value(spec: &KeySpec, raw: &str) -> Result<Value> {
    match spec.kind {
        ValueType::String | ValueType::Secret => Ok(Value::String(raw.to_string())),
        ValueType::Bool => parse_bool(spec.path, raw).map(Value::Boolean),
        ValueType::Integer => raw.trim().parse::<i64>().map(Value::Integer).map_err(|_| {
            DcosError::Config(format!("{} must be an integer, got '{raw}'", spec.path))
        }),
        ValueType::Url => {
            validate_url(raw)?;
            Ok(Value::String(raw.trim().trim_end_matches('/').to_string()))
        }
        ValueType::BoolOrPath => match parse_bool(spec.path, raw) {
            Ok(flag) => Ok(Value::Boolean(flag)),
            Err(_) if !raw.trim().is_empty() => Ok(Value::String(raw.trim().to_string())),
            Err(err) => Err(err),
        },
    }
}

pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Integer(n) => n.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Datetime(dt) => dt.to_string(),
        other => other.to_string(),
    }
}

fn lookup<'a>(table: &'a Table, path: &str) -> Option<&'a Value> {
    let (section, rest) = path.split_once('.')?;
    match table.get(section)? {
        Value::Table(inner) => {
            if rest.contains('.') {
                lookup(inner, rest).or_else(|| inner.get(rest))
            } else {
                inner.get(rest)
            }
        }
        _ => None,
    }
}

fn flatten(prefix: &str, table: &Table, out: &mut BTreeMap<String, Value>) {
    for (name, value) in table {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };
        match value {
            Value::Table(inner) => flatten(&path, inner, out),
            leaf => {
                out.insert(path, leaf.clone());
            }
        }
    }
}

/// One TOML layer on disk.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    path: PathBuf,
    table: Table,
}

impl ConfigFile {
    pub fn empty(path: &Path) -> Self {
        ConfigFile {
            path: path.to_path_buf(),
            table: Table::new(),
        }
    }

    /// Loads a layer; a missing file is an empty layer. Parse failures are retried since a
    /// concurrent writer may be mid-rename on some filesystems.
    pub fn load(path: &Path) -> Result<Self> {
        let mut last_err = None;
        for attempt in 0..TORN_READ_ATTEMPTS {
            let content = match fs::read_to_string(path) {
                Ok(content) => content,
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::empty(path)),
                Err(err) => return Err(DcosError::Io(err)),
            };
            match content.parse::<Table>() {
                Ok(table) => {
                    return Ok(ConfigFile {
                        path: path.to_path_buf(),
                        table,
                    })
                }
                Err(err) => {
                    tracing::debug!(
                        "config read attempt {} of {} failed: {err}",
                        attempt + 1,
                        path.display()
                    );
                    last_err = Some(err);
                    std::thread::sleep(Duration::from_millis(20));
                }
            }
        }
        match last_err {
            Some(err) => Err(DcosError::Config(format!(
                "config file {} is not valid TOML: {err}",
                path.display()
            ))),
            None => Ok(Self::empty(path)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        lookup(&self.table, path)
    }

    pub fn get_str(&self, path: &str) -> Option<String> {
        self.get(path).map(display_value)
    }

    pub fn set(&mut self, path: &str, value: Value) {
        let (section, rest) = match path.split_once('.') {
            Some(parts) => parts,
            None => return,
        };
        let entry = self
            .table
            .entry(section.to_string())
            .or_insert_with(|| Value::Table(Table::new()));
        if !entry.is_table() {
            *entry = Value::Table(Table::new());
        }
        if let Value::Table(inner) = entry {
            inner.insert(rest.to_string(), value);
        }
    }

    pub fn unset(&mut self, path: &str) -> Option<Value> {
        let (section, rest) = path.split_once('.')?;
        let removed = match self.table.get_mut(section)? {
            Value::Table(inner) => inner.remove(rest),
            _ => None,
        };
        let empty = matches!(self.table.get(section), Some(Value::Table(inner)) if inner.is_empty());
        if empty {
            self.table.remove(section);
        }
        removed
    }

    pub fn leaves(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        flatten("", &self.table, &mut out);
        out
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn render(&self) -> Result<String> {
        Ok(toml::to_string(&self.table)?)
    }

    pub fn save(&self) -> Result<()> {
        let content = self.render()?;
        write_atomic(&self.path, content.as_bytes(), Some(CONFIG_FILE_MODE))?;
        tracing::debug!("wrote config {}", self.path.display());
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnvLayer {
    values: BTreeMap<String, Value>,
}

impl EnvLayer {
    pub fn from_env() -> Self {
        Self::from_vars(|name| env::var(name).ok())
    }

    pub fn from_vars<F: Fn(&str) -> Option<String>>(read: F) -> Self {
        let mut values = BTreeMap::new();
        for (var, path) in ENV_OVERRIDES {
            if values.contains_key(*path) {
                continue;
            }
            let Some(raw) = read(var).filter(|v| !v.trim().is_empty()) else {
                continue;
            };
            let Some(spec) = spec_for(path) else { continue };
            match parse_value(spec, &raw) {
                Ok(value) => {
                    tracing::debug!("{path} overridden by {var}");
                    values.insert(path.to_string(), value);
                }
                Err(err) => tracing::warn!("ignoring {var}: {err}"),
            }
        }
        EnvLayer { values }
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        self.values.get(path)
    }
}

/// Outcome of a `set`, rendered as the diagnostic lines shown to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetOutcome {
    pub changed: bool,
    pub messages: Vec<String>,
}

/// Merged view of env > cluster > global with single-layer writes.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    global: ConfigFile,
    cluster: Option<ConfigFile>,
    env: EnvLayer,
    lock_path: PathBuf,
    plugin_sections: BTreeSet<String>,
}

impl ConfigStore {
    pub fn new(
        global: ConfigFile,
        cluster: Option<ConfigFile>,
        env: EnvLayer,
        lock_path: PathBuf,
    ) -> Self {
        ConfigStore {
            global,
            cluster,
            env,
            lock_path,
            plugin_sections: BTreeSet::new(),
        }
    }

    /// Sections contributed by installed plugins (plugin names and their verbs).
    pub fn with_plugin_sections<I: IntoIterator<Item = String>>(mut self, sections: I) -> Self {
        self.plugin_sections.extend(sections);
        self
    }

    pub fn cluster_file(&self) -> Option<&ConfigFile> {
        self.cluster.as_ref()
    }

    fn resolve_spec(&self, path: &str) -> Result<KeySpec> {
        let (section, _) = split_path(path)?;
        if let Some((_, message)) = DEPRECATED.iter().find(|(name, _)| *name == path) {
            return Err(DcosError::Config(format!("{message}.")));
        }
        if let Some(spec) = spec_for(path) {
            return Ok(*spec);
        }
        if !RESERVED_SECTIONS.contains(&section) && self.plugin_sections.contains(section) {
            return Ok(KeySpec {
                path: "",
                kind: ValueType::String,
                layer: Layer::Cluster,
            });
        }
        if self.children_of(path).is_empty() {
            Err(DcosError::Config(format!("unknown config key \"{path}\"")))
        } else {
            Err(self.non_leaf_error(path))
        }
    }

    fn children_of(&self, prefix: &str) -> Vec<String> {
        let needle = format!("{prefix}.");
        let mut children: BTreeSet<String> = SCHEMA
            .iter()
            .map(|spec| spec.path.to_string())
            .filter(|path| path.starts_with(&needle))
            .collect();
        children.extend(
            self.merged()
                .into_keys()
                .filter(|path| path.starts_with(&needle)),
        );
        children.into_iter().collect()
    }

    fn non_leaf_error(&self, path: &str) -> DcosError {
        let mut message = format!(
            "Property '{path}' doesn't fully specify a value - possible properties are:"
        );
        for child in self.children_of(path) {
            message.push('\n');
            message.push_str(&child);
        }
        DcosError::Config(message)
    }

    /// Typed value of a leaf, or `None` when not set. Non-leaf paths fail with their children.
    pub fn get(&self, path: &str) -> Result<Option<Value>> {
        if !path.contains('.') && !self.children_of(path).is_empty() {
            return Err(self.non_leaf_error(path));
        }
        split_path(path)?;
        if spec_for(path).is_none() && !self.children_of(path).is_empty() {
            return Err(self.non_leaf_error(path));
        }
        Ok(self.value(path))
    }

    /// Merged lookup without schema checks.
    pub fn value(&self, path: &str) -> Option<Value> {
        if let Some(value) = self.env.get(path) {
            return Some(value.clone());
        }
        if let Some(value) = self.cluster.as_ref().and_then(|c| c.get(path)) {
            return Some(value.clone());
        }
        self.global.get(path).cloned()
    }

    pub fn get_string(&self, path: &str) -> Option<String> {
        self.value(path).map(|v| display_value(&v))
    }

    pub fn get_bool(&self, path: &str) -> Option<bool> {
        match self.value(path)? {
            Value::Boolean(b) => Some(b),
            Value::String(s) => parse_bool(path, &s).ok(),
            _ => None,
        }
    }

    pub fn get_integer(&self, path: &str) -> Option<i64> {
        match self.value(path)? {
            Value::Integer(n) => Some(n),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn dcos_url(&self) -> Result<Url> {
        let raw = self
            .get_string(DCOS_URL)
            .ok_or_else(|| DcosError::missing_config(DCOS_URL))?;
        validate_url(&raw)
    }

    pub fn acs_token(&self) -> Option<String> {
        self.get_string(ACS_TOKEN).filter(|t| !t.is_empty())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.get_integer(TIMEOUT)
            .filter(|secs| *secs > 0)
            .map(|secs| Duration::from_secs(secs as u64))
    }

    pub fn merged(&self) -> BTreeMap<String, Value> {
        let mut out = self.global.leaves();
        if let Some(cluster) = &self.cluster {
            out.extend(cluster.leaves());
        }
        for (path, value) in &self.env.values {
            out.insert(path.clone(), value.clone());
        }
        out
    }

    /// `key value` lines sorted by key, secrets masked.
    pub fn show(&self) -> Vec<String> {
        self.merged()
            .into_iter()
            .map(|(path, value)| {
                let shown = match spec_for(&path) {
                    Some(spec) if spec.kind == ValueType::Secret => MASK.to_string(),
                    _ => display_value(&value),
                };
                format!("{path} {shown}")
            })
            .collect()
    }

    /// Config leaves handed to plugins, keyed by their DCOS_<SECTION>_<KEY> name.
    pub fn plugin_env(&self) -> BTreeMap<String, String> {
        self.merged()
            .into_iter()
            .filter(|(path, _)| {
                path.split_once('.')
                    .map(|(section, _)| !RESERVED_SECTIONS.contains(&section))
                    .unwrap_or(false)
            })
            .map(|(path, value)| (env_var_name(&path), display_value(&value)))
            .collect()
    }

    fn target_layer(&self, spec: &KeySpec) -> Layer {
        match (spec.layer, &self.cluster) {
            (Layer::Cluster, Some(_)) => Layer::Cluster,
            (Layer::Cluster, None) => {
                tracing::info!("no cluster is attached, writing to the global config");
                Layer::Global
            }
            (Layer::Global, _) => Layer::Global,
        }
    }

    fn layer_mut(&mut self, layer: Layer) -> &mut ConfigFile {
        match (layer, self.cluster.as_mut()) {
            (Layer::Cluster, Some(cluster)) => cluster,
            _ => &mut self.global,
        }
    }

    pub fn set(&mut self, path: &str, raw: &str) -> Result<SetOutcome> {
        let spec = self.resolve_spec(path)?;
        let value = parse_value(&spec, raw)?;
        let layer = self.target_layer(&spec);
        let _lock = FileLock::acquire(&self.lock_path)?;
        let fresh = ConfigFile::load(self.layer_mut(layer).path())?;
        let file = self.layer_mut(layer);
        *file = fresh;

        let secret = spec.kind == ValueType::Secret;
        let mut messages = Vec::new();
        let previous = file.get(path).cloned();
        let changed = previous.as_ref() != Some(&value);
        match &previous {
            None if secret => messages.push(format!("[{path}]: set")),
            None => messages.push(format!("[{path}]: set to '{}'", display_value(&value))),
            Some(_) if !changed && secret => {
                messages.push(format!("[{path}]: already set to that value"))
            }
            Some(old) if !changed => {
                messages.push(format!("[{path}]: already set to '{}'", display_value(old)))
            }
            Some(_) if secret => messages.push(format!("[{path}]: changed")),
            Some(old) => messages.push(format!(
                "[{path}]: changed from '{}' to '{}'",
                display_value(old),
                display_value(&value)
            )),
        }
        if !changed {
            return Ok(SetOutcome {
                changed: false,
                messages,
            });
        }

        file.set(path, value);
        if path == DCOS_URL && file.unset(ACS_TOKEN).is_some() {
            messages.push(format!("[{ACS_TOKEN}]: removed"));
        }
        file.save()?;
        Ok(SetOutcome {
            changed: true,
            messages,
        })
    }

    pub fn unset(&mut self, path: &str) -> Result<String> {
        split_path(path)?;
        let layer = match spec_for(path) {
            Some(spec) => self.target_layer(spec),
            None if self.cluster.is_some() => Layer::Cluster,
            None => Layer::Global,
        };
        let _lock = FileLock::acquire(&self.lock_path)?;
        let fresh = ConfigFile::load(self.layer_mut(layer).path())?;
        let file = self.layer_mut(layer);
        *file = fresh;
        if file.unset(path).is_none() {
            return Err(DcosError::Config(format!("Property '{path}' doesn't exist")));
        }
        file.save()?;
        Ok(format!("Removed [{path}]"))
    }
}

pub fn env_var_name(path: &str) -> String {
    format!("DCOS_{}", path.replace(['.', '-'], "_").to_uppercase())
}

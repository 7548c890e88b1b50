use crate::error::{DcosError, Result};
use crate::fsutil::{
    copy_dir_all, is_executable, process_alive, remove_path, unique_suffix, write_atomic, FileLock,
};
use crate::http::HttpClient;
use crate::package::{self, ArtifactKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

pub const MANIFEST_FILE: &str = "plugin.toml";
pub const RECORD_FILE: &str = "install.json";
pub const SCHEMA_VERSION: u32 = 1;
const STAGING_PREFIX: &str = ".staging-";
const TRASH_PREFIX: &str = ".trash-";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CommandSpec {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
}

impl Manifest {
    /// Manifest for a tree that only ships `bin/dcos-<verb>` executables.
    pub fn synthesize(name: &str, root: &Path) -> Result<Self> {
        let bin = root.join("bin");
        let mut commands = Vec::new();
        if bin.is_dir() {
            let mut entries: Vec<String> = fs::read_dir(&bin)?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.file_name().to_string_lossy().to_string())
                .filter(|file| file.starts_with("dcos-"))
                .collect();
            entries.sort();
            for file in entries {
                let verb = file
                    .trim_start_matches("dcos-")
                    .trim_end_matches(".exe")
                    .to_string();
                if verb.is_empty() {
                    continue;
                }
                commands.push(CommandSpec {
                    name: verb,
                    path: format!("bin/{}", file.trim_end_matches(".exe")),
                    description: String::new(),
                });
            }
        }
        Ok(Manifest {
            schema_version: SCHEMA_VERSION,
            name: name.to_string(),
            version: None,
            commands,
        })
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(MANIFEST_FILE);
        let content = fs::read_to_string(&path)?;
        toml::from_str(&content).map_err(|err| {
            DcosError::State(format!("invalid plugin manifest {}: {err}", path.display()))
        })
    }
}

/// Provenance written next to the manifest at install time.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct InstallRecord {
    pub name: String,
    pub version: String,
    pub installed_at: String,
    pub source: String,
    pub root: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Plugin {
    pub manifest: Manifest,
    pub dir: PathBuf,
    pub record: Option<InstallRecord>,
}

impl Plugin {
    pub fn load(dir: &Path) -> Result<Self> {
        let manifest = Manifest::load(dir)?;
        let record = fs::read(dir.join(RECORD_FILE))
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok());
        Ok(Plugin {
            manifest,
            dir: dir.to_path_buf(),
            record,
        })
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn version(&self) -> &str {
        self.manifest
            .version
            .as_deref()
            .or(self.record.as_ref().map(|r| r.version.as_str()))
            .unwrap_or("")
    }

    pub fn command_path(&self, command: &CommandSpec) -> PathBuf {
        command_path(&self.dir, command)
    }

    pub fn verbs(&self) -> Vec<&str> {
        self.manifest.commands.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name(),
            "version": self.version(),
            "commands": self.manifest.commands.iter().map(|c| serde_json::json!({
                "name": c.name,
                "path": self.command_path(c),
                "description": c.description,
            })).collect::<Vec<_>>(),
            "root": self.dir,
            "installed_at": self.record.as_ref().map(|r| r.installed_at.clone()),
            "source": self.record.as_ref().map(|r| r.source.clone()),
            "sha256": self.record.as_ref().and_then(|r| r.sha256.clone()),
        })
    }
}

fn command_path(root: &Path, command: &CommandSpec) -> PathBuf {
    let path = root.join(&command.path);
    if cfg!(windows) && path.extension().is_none() {
        path.with_extension("exe")
    } else {
        path
    }
}

/// Resolved target for a plugin verb.
#[derive(Debug, Clone)]
pub struct VerbTarget {
    pub plugin: String,
    pub command: CommandSpec,
    pub executable: PathBuf,
}

/// What `plugin add` was pointed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Url(String),
    Path(PathBuf),
}

impl Source {
    pub fn parse(raw: &str) -> Self {
        if raw.starts_with("http://") || raw.starts_with("https://") {
            Source::Url(raw.to_string())
        } else {
            Source::Path(PathBuf::from(raw))
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Plugin name for bare executables; archives and directories carry their own.
    pub name: Option<String>,
    pub update: bool,
    pub version: Option<String>,
    /// Expected sha256 of the downloaded or local artifact.
    pub checksum: Option<String>,
    /// Artifact kind declared by the package registry.
    pub kind: Option<ArtifactKind>,
    /// Provenance recorded instead of the local path (registry or download URL).
    pub source: Option<String>,
}

/// Installed plugins of one cluster.
#[derive(Debug, Clone)]
pub struct PluginStore {
    root: PathBuf,
    lock_path: PathBuf,
}

impl PluginStore {
    pub fn new(root: &Path, lock_path: &Path) -> Self {
        PluginStore {
            root: root.to_path_buf(),
            lock_path: lock_path.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Installed plugins in lexicographic name order. Broken trees are skipped with a warning.
    pub fn list(&self) -> Result<Vec<Plugin>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(DcosError::Io(err)),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !entry.file_type()?.is_dir() {
                continue;
            }
            names.push(name);
        }
        names.sort();
        let mut plugins = Vec::new();
        for name in names {
            match Plugin::load(&self.root.join(&name)) {
                Ok(plugin) => plugins.push(plugin),
                Err(err) => tracing::warn!("skipping plugin '{name}': {err}"),
            }
        }
        Ok(plugins)
    }

    /// Verb table: first declaration in plugin-name order wins.
    pub fn verbs(&self) -> Result<BTreeMap<String, VerbTarget>> {
        let mut table: BTreeMap<String, VerbTarget> = BTreeMap::new();
        for plugin in self.list()? {
            for command in &plugin.manifest.commands {
                if let Some(existing) = table.get(&command.name) {
                    tracing::warn!(
                        "command '{}' of plugin '{}' is shadowed by plugin '{}'",
                        command.name,
                        plugin.name(),
                        existing.plugin
                    );
                    continue;
                }
                table.insert(
                    command.name.clone(),
                    VerbTarget {
                        plugin: plugin.name().to_string(),
                        command: command.clone(),
                        executable: plugin.command_path(command),
                    },
                );
            }
        }
        Ok(table)
    }

    pub fn resolve(&self, verb: &str) -> Result<Option<VerbTarget>> {
        Ok(self.verbs()?.remove(verb))
    }

    /// Deletes leftovers of interrupted installs. Must run under the lock: trash only
    /// exists inside `commit`, while staging trees of live processes are kept.
    pub fn repair(&self) -> Result<()> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Ok(());
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let leftover = if let Some(rest) = name.strip_prefix(STAGING_PREFIX) {
                let owner = rest.split('-').next().and_then(|pid| pid.parse::<u32>().ok());
                !owner.is_some_and(process_alive)
            } else {
                name.starts_with(TRASH_PREFIX)
            };
            if leftover {
                tracing::info!("removing leftover {name}");
                remove_path(&entry.path())?;
            }
        }
        Ok(())
    }

    fn staging_dir(&self) -> PathBuf {
        self.root
            .join(format!("{STAGING_PREFIX}{}", unique_suffix().replace('.', "-")))
    }

    /// Checks a built tree and returns its manifest, writing a synthesized one when absent.
    pub fn validate(&self, tree: &Path, fallback_name: &str) -> Result<Manifest> {
        let manifest = if tree.join(MANIFEST_FILE).exists() {
            Manifest::load(tree)?
        } else {
            let manifest = Manifest::synthesize(fallback_name, tree)?;
            if manifest.commands.is_empty() {
                return Err(DcosError::State(format!("{fallback_name} has no commands")));
            }
            write_atomic(
                &tree.join(MANIFEST_FILE),
                toml::to_string_pretty(&manifest)?.as_bytes(),
                None,
            )?;
            manifest
        };
        if manifest.schema_version != SCHEMA_VERSION {
            return Err(DcosError::State(format!(
                "unsupported plugin schema_version {} in '{}'",
                manifest.schema_version, manifest.name
            )));
        }
        if manifest.name.is_empty()
            || manifest.name.starts_with('.')
            || manifest.name.contains(['/', '\\'])
        {
            return Err(DcosError::State(format!(
                "invalid plugin name '{}'",
                manifest.name
            )));
        }
        if manifest.commands.is_empty() {
            return Err(DcosError::State(format!("{} has no commands", manifest.name)));
        }
        let mut seen = BTreeMap::new();
        for command in &manifest.commands {
            if seen.insert(command.name.as_str(), ()).is_some() {
                return Err(DcosError::State(format!(
                    "command '{}' is declared twice by plugin '{}'",
                    command.name, manifest.name
                )));
            }
            let relative = Path::new(&command.path);
            let inside = !command.path.is_empty()
                && relative
                    .components()
                    .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
            if !inside {
                return Err(DcosError::State(format!(
                    "command '{}' of plugin '{}' must be a path inside the plugin: '{}'",
                    command.name, manifest.name, command.path
                )));
            }
            let path = command_path(tree, command);
            if !path.is_file() {
                return Err(DcosError::State(format!(
                    "command '{}' of plugin '{}' points to missing file '{}'",
                    command.name, manifest.name, command.path
                )));
            }
            if !fs::canonicalize(&path)?.starts_with(fs::canonicalize(tree)?) {
                return Err(DcosError::State(format!(
                    "command '{}' of plugin '{}' links outside the plugin: '{}'",
                    command.name, manifest.name, command.path
                )));
            }
            if !is_executable(&path) {
                return Err(DcosError::State(format!(
                    "command '{}' of plugin '{}' is not executable: '{}'",
                    command.name, manifest.name, command.path
                )));
            }
        }
        self.check_collisions(&manifest)?;
        Ok(manifest)
    }

    /// Refuses verbs another installed plugin already binds.
    fn check_collisions(&self, manifest: &Manifest) -> Result<()> {
        for other in self.list()? {
            if other.name() == manifest.name {
                continue;
            }
            for command in &manifest.commands {
                if other.verbs().contains(&command.name.as_str()) {
                    return Err(DcosError::State(format!(
                        "command '{}' is already provided by plugin '{}'",
                        command.name,
                        other.name()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Moves a validated staging tree into place under the lock.
    fn commit(&self, staging: &Path, manifest: &Manifest, update: bool) -> Result<Plugin> {
        let _lock = FileLock::acquire(&self.lock_path)?;
        let target = self.root.join(&manifest.name);
        let had_previous = target.exists();
        if had_previous && !update {
            return Err(DcosError::State(format!(
                "'{}' is already installed",
                manifest.name
            )));
        }
        self.check_collisions(manifest)?;
        let trash = self.root.join(format!(
            "{TRASH_PREFIX}{}-{}",
            manifest.name,
            unique_suffix().replace('.', "-")
        ));
        if had_previous {
            fs::rename(&target, &trash)?;
        }
        if let Err(err) = fs::rename(staging, &target) {
            if had_previous {
                let _ = fs::rename(&trash, &target);
            }
            return Err(DcosError::Io(err));
        }
        if had_previous {
            remove_path(&trash)?;
        }
        Plugin::load(&target)
    }

    /// Builds, validates and installs a plugin from a local path or URL.
    pub fn install(
        &self,
        source: &Source,
        options: &InstallOptions,
        http: Option<&HttpClient<'_>>,
    ) -> Result<Plugin> {
        fs::create_dir_all(&self.root)?;
        {
            let _lock = FileLock::acquire(&self.lock_path)?;
            self.repair()?;
        }
        let staging = self.staging_dir();
        let result = self.install_into(&staging, source, options, http);
        let _ = remove_path(&staging);
        if let Ok(plugin) = &result {
            tracing::info!("installed plugin {} into {}", plugin.name(), plugin.dir.display());
        }
        result
    }

    fn install_into(
        &self,
        staging: &Path,
        source: &Source,
        options: &InstallOptions,
        http: Option<&HttpClient<'_>>,
    ) -> Result<Plugin> {
        let tree = staging.join("tree");
        let (local, source_ref, sha256) = match source {
            Source::Path(path) if !path.exists() => {
                return Err(DcosError::State(format!(
                    "'{}' is not a plugin directory, archive or executable",
                    path.display()
                )))
            }
            Source::Path(path) => (
                path.clone(),
                fs::canonicalize(path)?.display().to_string(),
                None,
            ),
            Source::Url(url) => {
                let http = http.ok_or_else(|| {
                    DcosError::Usage(format!("no HTTP client available to download {url}"))
                })?;
                let download = package::download(http, url, staging, options.checksum.as_deref())?;
                (download.path, url.clone(), Some(download.sha256))
            }
        };
        let default_name = options.name.clone().unwrap_or_else(|| plugin_name_from_path(&local));
        if local.is_dir() {
            copy_dir_all(&local, &tree)?;
        } else if local.is_file() {
            if let (None, Some(expected)) = (&sha256, &options.checksum) {
                let computed = package::sha256_file(&local)?;
                if !computed.eq_ignore_ascii_case(expected.trim()) {
                    return Err(DcosError::Integrity(format!(
                        "computed checksum {computed} for {}, expected {expected}",
                        local.display()
                    )));
                }
            }
            let kind = package::checked_kind(options.kind, &local)?;
            tracing::debug!("unpacking {} as {kind:?}", local.display());
            package::unpack(kind, &local, &tree, &default_name)?;
        } else {
            return Err(DcosError::State(format!(
                "'{}' is not a plugin directory, archive or executable",
                local.display()
            )));
        }

        let manifest = self.validate(&tree, &default_name)?;
        let version = options
            .version
            .clone()
            .or_else(|| manifest.version.clone())
            .unwrap_or_default();
        let record = InstallRecord {
            name: manifest.name.clone(),
            version,
            installed_at: chrono::Utc::now().to_rfc3339(),
            source: options.source.clone().unwrap_or(source_ref),
            root: self.root.join(&manifest.name),
            sha256: sha256.or_else(|| options.checksum.clone().filter(|_| local.is_file())),
        };
        write_atomic(
            &tree.join(RECORD_FILE),
            serde_json::to_string_pretty(&record)?.as_bytes(),
            None,
        )?;
        self.commit(&tree, &manifest, options.update)
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let _lock = FileLock::acquire(&self.lock_path)?;
        let dir = self.root.join(name);
        if name.is_empty() || name.starts_with('.') || !dir.join(MANIFEST_FILE).is_file() {
            return Err(DcosError::State(format!("'{name}' is not a plugin directory")));
        }
        remove_path(&dir)?;
        if fs::remove_dir(&self.root).is_ok() {
            tracing::debug!("removed empty plugin directory {}", self.root.display());
        }
        Ok(())
    }
}

/// Plugin name derived from a file or directory name.
fn plugin_name_from_path(path: &Path) -> String {
    let file = path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| "plugin".to_string());
    for suffix in [".tar.gz", ".tgz", ".zip", ".exe"] {
        if let Some(stripped) = file.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    file
}

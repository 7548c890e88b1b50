use crate::config::{self, ConfigFile, Layer};
use crate::error::{DcosError, Result};
use crate::fsutil::{remove_path, unique_suffix, write_atomic, FileLock};
use dirs::home_dir;
use std::env;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

pub const CLUSTERS_DIR: &str = "clusters";
pub const CONFIG_FILE: &str = "dcos.toml";
pub const ATTACHED_FILE: &str = "attached";
pub const CA_FILE: &str = "dcos_ca.crt";
pub const PLUGINS_DIR: &str = "plugins";
const LOCK_FILE: &str = ".lock";
const SCAN_ATTEMPTS: usize = 3;

pub const NO_CLUSTERS: &str =
    "No clusters are currently configured. To configure one, run `dcos cluster setup <dcos_url>`";
pub const NOT_ATTACHED: &str =
    "no cluster is attached. Please run `dcos cluster attach <cluster-name>`";

/// Cluster ids name a directory under `clusters/`, so only one plain path segment is accepted.
pub fn validate_cluster_id(id: &str) -> Result<()> {
    let mut components = Path::new(id).components();
    let single_segment = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if !single_segment || id.starts_with('.') || id.contains(['/', '\\']) {
        return Err(DcosError::Integrity(format!("invalid cluster ID '{id}'")));
    }
    Ok(())
}

/// Resolves the CLI home from DCOS_DIR (made absolute) or `~/.dcos`.
pub fn cli_dir() -> Result<PathBuf> {
    if let Ok(raw) = env::var("DCOS_DIR") {
        if !raw.trim().is_empty() {
            let path = PathBuf::from(raw);
            if path.is_absolute() {
                return Ok(path);
            }
            return Ok(env::current_dir()?.join(path));
        }
    }
    let home = home_dir().ok_or_else(|| {
        DcosError::Config("unable to determine home directory; set DCOS_DIR".to_string())
    })?;
    Ok(home.join(".dcos"))
}

#[derive(Debug, Clone)]
pub struct Cluster {
    id: String,
    dir: PathBuf,
    config: ConfigFile,
    attached: bool,
}

impl Cluster {
    fn load(dir: &Path) -> Result<Option<Self>> {
        let config_path = dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(None);
        }
        let id = dir
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(Some(Cluster {
            id,
            dir: dir.to_path_buf(),
            config: ConfigFile::load(&config_path)?,
            attached: dir.join(ATTACHED_FILE).exists(),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> String {
        self.config
            .get_str(config::CLUSTER_NAME)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| self.id.clone())
    }

    pub fn url(&self) -> Option<String> {
        self.config.get_str(config::DCOS_URL)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &ConfigFile {
        &self.config
    }

    pub fn attached(&self) -> bool {
        self.attached
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.dir.join(PLUGINS_DIR)
    }

    pub fn ca_path(&self) -> PathBuf {
        self.dir.join(CA_FILE)
    }
}

enum Scan {
    Done(Vec<Cluster>),
    Raced,
}

#[derive(Debug, Clone)]
pub struct Registry {
    root: PathBuf,
}

impl Registry {
    pub fn new(root: &Path) -> Self {
        Registry {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn clusters_dir(&self) -> PathBuf {
        self.root.join(CLUSTERS_DIR)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn global_config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn lock(&self) -> Result<FileLock> {
        FileLock::acquire(&self.lock_path())
    }

    fn scan(&self) -> Result<Scan> {
        let entries = match fs::read_dir(self.clusters_dir()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Scan::Done(Vec::new())),
            Err(err) => return Err(DcosError::Io(err)),
        };
        let mut clusters = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Scan::Raced),
                Err(err) => return Err(DcosError::Io(err)),
            };
            let name = entry.file_name().to_string_lossy().to_string();
            // Staging and trash directories from setup.
            if name.starts_with('.') {
                continue;
            }
            let path = entry.path();
            if !path.is_dir() {
                if !path.exists() {
                    return Ok(Scan::Raced);
                }
                continue;
            }
            match Cluster::load(&path) {
                Ok(Some(cluster)) => clusters.push(cluster),
                Ok(None) if !path.exists() => return Ok(Scan::Raced),
                Ok(None) => tracing::debug!("skipping {}: no {CONFIG_FILE}", path.display()),
                Err(_) if !path.exists() => return Ok(Scan::Raced),
                Err(err) => return Err(err),
            }
        }
        clusters.sort_by(|a, b| a.name().cmp(&b.name()).then_with(|| a.id.cmp(&b.id)));
        Ok(Scan::Done(clusters))
    }

    /// All configured clusters sorted by name. Lock-free; retried when a concurrent
    /// mutation removes a directory mid-scan.
    pub fn list(&self) -> Result<Vec<Cluster>> {
        for attempt in 0..SCAN_ATTEMPTS {
            match self.scan()? {
                Scan::Done(clusters) => return Ok(clusters),
                Scan::Raced => tracing::debug!("cluster scan raced (attempt {})", attempt + 1),
            }
        }
        Err(DcosError::State(
            "cluster registry is in an inconsistent state, please retry".to_string(),
        ))
    }

    pub fn find(&self, name_or_id: &str) -> Result<Cluster> {
        let clusters = self.list()?;
        let exact: Vec<&Cluster> = clusters
            .iter()
            .filter(|c| c.id == name_or_id || c.name() == name_or_id)
            .collect();
        let matches: Vec<&Cluster> = if exact.is_empty() {
            clusters
                .iter()
                .filter(|c| c.id.starts_with(name_or_id))
                .collect()
        } else {
            exact
        };
        match matches.as_slice() {
            [single] => Ok((*single).clone()),
            [] => Err(DcosError::State(format!("no match found for '{name_or_id}'"))),
            _ => Err(DcosError::State(format!(
                "multiple matches found for '{name_or_id}'"
            ))),
        }
    }

    /// The cluster verbs implicitly target: `selected` (DCOS_CLUSTER), the only cluster,
    /// or the attached one.
    pub fn current(&self, selected: Option<&str>) -> Result<Cluster> {
        if let Some(selected) = selected.filter(|s| !s.trim().is_empty()) {
            return self.find(selected);
        }
        let clusters = self.list()?;
        if clusters.is_empty() {
            return Err(DcosError::State(NO_CLUSTERS.to_string()));
        }
        if clusters.len() == 1 {
            return Ok(clusters[0].clone());
        }
        let attached: Vec<&Cluster> = clusters.iter().filter(|c| c.attached).collect();
        match attached.as_slice() {
            [single] => Ok((*single).clone()),
            [] => Err(DcosError::State(NOT_ATTACHED.to_string())),
            _ => Err(DcosError::State("multiple clusters are attached".to_string())),
        }
    }

    fn attach_locked(&self, target: &Cluster) -> Result<bool> {
        let marker = target.dir.join(ATTACHED_FILE);
        let others: Vec<PathBuf> = self
            .list()?
            .into_iter()
            .filter(|c| c.id != target.id && c.dir.join(ATTACHED_FILE).exists())
            .map(|c| c.dir.join(ATTACHED_FILE))
            .collect();
        if marker.exists() && others.is_empty() {
            return Ok(false);
        }
        match others.split_first() {
            Some((previous, rest)) if !marker.exists() => {
                fs::rename(previous, &marker)?;
                for stale in rest {
                    remove_path(stale)?;
                }
            }
            _ => {
                if !marker.exists() {
                    write_atomic(&marker, b"", None)?;
                }
                for stale in &others {
                    remove_path(stale)?;
                }
            }
        }
        tracing::info!("attached cluster {}", target.id);
        Ok(true)
    }

    /// Moves the attached marker to `target`. Returns false when it was already attached.
    pub fn attach(&self, target: &Cluster) -> Result<bool> {
        let _lock = self.lock()?;
        self.attach_locked(target)
    }

    pub fn rename(&self, name_or_id: &str, new_name: &str) -> Result<String> {
        if new_name.trim().is_empty() {
            return Err(DcosError::Usage("cluster name cannot be empty".to_string()));
        }
        let _lock = self.lock()?;
        let cluster = self.find(name_or_id)?;
        let taken = self
            .list()?
            .iter()
            .any(|c| c.id != cluster.id && c.name() == new_name);
        if taken {
            return Err(DcosError::State(format!(
                "cluster name '{new_name}' is already in use"
            )));
        }
        let mut config = ConfigFile::load(cluster.config.path())?;
        config.set(config::CLUSTER_NAME, toml::Value::String(new_name.to_string()));
        config.save()?;
        Ok(cluster.name())
    }

    pub fn remove(&self, name_or_id: &str) -> Result<String> {
        let _lock = self.lock()?;
        let cluster = self.find(name_or_id)?;
        remove_path(&cluster.dir)?;
        Ok(cluster.name())
    }

    pub fn remove_all(&self) -> Result<Vec<String>> {
        let _lock = self.lock()?;
        let mut removed = Vec::new();
        for cluster in self.list()? {
            remove_path(&cluster.dir)?;
            removed.push(cluster.name());
        }
        Ok(removed)
    }

    /// Fresh directory under `clusters/` that `list` ignores until it is committed.
    pub fn staging_dir(&self) -> PathBuf {
        self.clusters_dir()
            .join(format!(".setup-{}", unique_suffix()))
    }

    /// Swaps a fully built staging directory into `clusters/<id>` and attaches it.
    pub fn commit_staged(&self, staging: &Path, id: &str) -> Result<Cluster> {
        validate_cluster_id(id)?;
        let _lock = self.lock()?;
        let target = self.clusters_dir().join(id);
        let trash = self
            .clusters_dir()
            .join(format!(".trash-{id}-{}", unique_suffix()));
        let had_previous = target.exists();
        let was_attached = target.join(ATTACHED_FILE).exists();
        if had_previous {
            fs::rename(&target, &trash)?;
        }
        if let Err(err) = fs::rename(staging, &target) {
            if had_previous {
                let _ = fs::rename(&trash, &target);
            }
            return Err(DcosError::Io(err));
        }
        if was_attached {
            write_atomic(&target.join(ATTACHED_FILE), b"", None)?;
        }
        if had_previous {
            remove_path(&trash)?;
        }
        let cluster = Cluster::load(&target)?.ok_or_else(|| {
            DcosError::State(format!("cluster {id} is missing its {CONFIG_FILE}"))
        })?;
        self.attach_locked(&cluster)?;
        Cluster::load(&target)?
            .ok_or_else(|| DcosError::State(format!("cluster {id} disappeared during setup")))
    }

    /// Promotes an old single-file config into a cluster record when it carries a token.
    /// `identify` resolves the cluster id from the legacy URL.
    pub fn migrate_legacy(
        &self,
        legacy_path: &Path,
        identify: &dyn Fn(&ConfigFile) -> Result<String>,
    ) -> Result<Option<Cluster>> {
        if !legacy_path.exists() || !self.list()?.is_empty() {
            return Ok(None);
        }
        let legacy = ConfigFile::load(legacy_path)?;
        if legacy.get(config::DCOS_URL).is_none() {
            return Ok(None);
        }
        let has_token = legacy
            .get_str(config::ACS_TOKEN)
            .map(|t| !t.is_empty())
            .unwrap_or(false);
        if !has_token {
            tracing::warn!(
                "ignoring legacy config {} without an access token; run `dcos cluster setup <dcos_url>`",
                legacy_path.display()
            );
            return Ok(None);
        }
        let id = match identify(&legacy).and_then(|id| validate_cluster_id(&id).map(|()| id)) {
            Ok(id) => id,
            Err(err) => {
                tracing::warn!("couldn't migrate legacy config {}: {err}", legacy_path.display());
                return Ok(None);
            }
        };

        let _lock = self.lock()?;
        if !self.list()?.is_empty() {
            return Ok(None);
        }
        let mut cluster_config = ConfigFile::empty(&self.clusters_dir().join(&id).join(CONFIG_FILE));
        let mut remaining = ConfigFile::load(legacy_path)?;
        for (path, value) in legacy.leaves() {
            let global_only = config::spec_for(&path)
                .map(|spec| spec.layer == Layer::Global)
                .unwrap_or(false);
            if !global_only {
                cluster_config.set(&path, value);
                remaining.unset(&path);
            }
        }
        cluster_config.save()?;
        if legacy_path == self.global_config_path() {
            remaining.save()?;
        }
        let cluster = Cluster::load(&self.clusters_dir().join(&id))?
            .ok_or_else(|| DcosError::State(format!("migrated cluster {id} is missing")))?;
        self.attach_locked(&cluster)?;
        tracing::warn!(
            "migrated legacy config {} to cluster {id}",
            legacy_path.display()
        );
        Ok(Some(cluster))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn add_cluster(root: &Path, id: &str, name: &str, attached: bool) {
        let dir = root.join(CLUSTERS_DIR).join(id);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join(CONFIG_FILE),
            format!("[core]\ndcos_url = \"https://{id}.example\"\n\n[cluster]\nname = \"{name}\"\n"),
        )
        .unwrap();
        if attached {
            fs::write(dir.join(ATTACHED_FILE), "").unwrap();
        }
    }

    fn markers(root: &Path) -> Vec<String> {
        let mut found = Vec::new();
        for entry in fs::read_dir(root.join(CLUSTERS_DIR)).unwrap() {
            let entry = entry.unwrap();
            if entry.path().join(ATTACHED_FILE).exists() {
                found.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        found
    }

    #[test]
    fn list_is_sorted_by_name_and_skips_staging() {
        let dir = tempdir().unwrap();
        add_cluster(dir.path(), "id-2", "beta", false);
        add_cluster(dir.path(), "id-1", "gamma", true);
        add_cluster(dir.path(), "id-3", "alpha", false);
        fs::create_dir_all(dir.path().join("clusters/.setup-1")).unwrap();
        fs::create_dir_all(dir.path().join("clusters/empty")).unwrap();
        let registry = Registry::new(dir.path());
        let names: Vec<String> = registry.list().unwrap().iter().map(Cluster::name).collect();
        assert_eq!(names, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn cluster_ids_must_be_single_segments() {
        assert!(validate_cluster_id("79e8f7c4-2f06-4b1a-9a7e-3c3f2d3b1e0a").is_ok());
        for bad in ["", ".", "..", "../x", "../../escaped", "a/b", "a\\b", ".hidden", "/abs"] {
            let err = validate_cluster_id(bad).unwrap_err();
            assert!(matches!(err, DcosError::Integrity(_)), "{bad:?} accepted");
        }
    }

    #[test]
    fn commit_refuses_escaping_ids() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("dcos");
        let registry = Registry::new(&root);
        let staging = registry.staging_dir();
        fs::create_dir_all(&staging).unwrap();
        fs::write(staging.join(CONFIG_FILE), "[core]\ndcos_url = \"https://x.example\"\n").unwrap();
        let outside = dir.path().join("victim");
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("keep"), "data").unwrap();

        let err = registry.commit_staged(&staging, "../../victim").unwrap_err();
        assert!(matches!(err, DcosError::Integrity(_)));
        assert!(outside.join("keep").is_file());
        assert!(staging.join(CONFIG_FILE).is_file());
    }

    #[test]
    fn find_by_name_id_and_prefix() {
        let dir = tempdir().unwrap();
        add_cluster(dir.path(), "abc-123", "prod", false);
        add_cluster(dir.path(), "abd-456", "dev", false);
        let registry = Registry::new(dir.path());
        assert_eq!(registry.find("prod").unwrap().id(), "abc-123");
        assert_eq!(registry.find("abd-456").unwrap().name(), "dev");
        assert_eq!(registry.find("abc").unwrap().name(), "prod");
        assert_eq!(
            registry.find("ab").unwrap_err().to_string(),
            "multiple matches found for 'ab'"
        );
        assert_eq!(
            registry.find("zzz").unwrap_err().to_string(),
            "no match found for 'zzz'"
        );
    }

    #[test]
    fn attach_moves_single_marker_and_is_idempotent() {
        let dir = tempdir().unwrap();
        add_cluster(dir.path(), "a", "one", true);
        add_cluster(dir.path(), "b", "two", false);
        let registry = Registry::new(dir.path());
        let two = registry.find("two").unwrap();
        assert!(registry.attach(&two).unwrap());
        assert_eq!(markers(dir.path()), vec!["b".to_string()]);
        assert!(!registry.attach(&two).unwrap());
        assert_eq!(markers(dir.path()), vec!["b".to_string()]);
        assert_eq!(registry.current(None).unwrap().id(), "b");
    }

    #[test]
    fn current_requires_attachment_with_several_clusters() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(dir.path());
        assert_eq!(registry.current(None).unwrap_err().to_string(), NO_CLUSTERS);
        add_cluster(dir.path(), "a", "one", false);
        assert_eq!(registry.current(None).unwrap().id(), "a");
        add_cluster(dir.path(), "b", "two", false);
        assert_eq!(registry.current(None).unwrap_err().to_string(), NOT_ATTACHED);
        assert_eq!(registry.current(Some("two")).unwrap().id(), "b");
    }

    #[test]
    fn rename_keeps_id_and_rejects_duplicates() {
        let dir = tempdir().unwrap();
        add_cluster(dir.path(), "a", "one", true);
        add_cluster(dir.path(), "b", "two", false);
        let registry = Registry::new(dir.path());
        assert_eq!(registry.rename("one", "uno").unwrap(), "one");
        let renamed = registry.find("uno").unwrap();
        assert_eq!(renamed.id(), "a");
        assert!(renamed.attached());
        assert!(registry.rename("uno", "two").is_err());
    }

    #[test]
    fn remove_attached_leaves_nothing_attached() {
        let dir = tempdir().unwrap();
        add_cluster(dir.path(), "a", "one", true);
        add_cluster(dir.path(), "b", "two", false);
        let registry = Registry::new(dir.path());
        assert_eq!(registry.remove("one").unwrap(), "one");
        assert!(markers(dir.path()).is_empty());
        assert_eq!(registry.list().unwrap().len(), 1);
        assert_eq!(registry.remove_all().unwrap(), vec!["two".to_string()]);
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn commit_staged_replaces_and_attaches() {
        let dir = tempdir().unwrap();
        add_cluster(dir.path(), "a", "one", true);
        add_cluster(dir.path(), "b", "two", false);
        let registry = Registry::new(dir.path());
        let staging = registry.staging_dir();
        fs::create_dir_all(&staging).unwrap();
        fs::write(
            staging.join(CONFIG_FILE),
            "[cluster]\nname = \"two-again\"\n",
        )
        .unwrap();
        let cluster = registry.commit_staged(&staging, "b").unwrap();
        assert_eq!(cluster.name(), "two-again");
        assert!(cluster.attached());
        assert_eq!(markers(dir.path()), vec!["b".to_string()]);
        assert!(!staging.exists());
        let leftovers: Vec<_> = fs::read_dir(dir.path().join(CLUSTERS_DIR))
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn legacy_config_migrates_only_with_token() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(dir.path());
        let legacy = registry.global_config_path();
        fs::write(&legacy, "[core]\ndcos_url = \"https://old.example\"\nreporting = true\n").unwrap();
        let identify = |_: &ConfigFile| -> Result<String> { Ok("legacy-id".to_string()) };
        assert!(registry.migrate_legacy(&legacy, &identify).unwrap().is_none());
        assert!(registry.list().unwrap().is_empty());

        fs::write(
            &legacy,
            "[core]\ndcos_url = \"https://old.example\"\ndcos_acs_token = \"tok\"\nreporting = true\n",
        )
        .unwrap();
        let cluster = registry.migrate_legacy(&legacy, &identify).unwrap().unwrap();
        assert_eq!(cluster.id(), "legacy-id");
        assert!(cluster.attached());
        assert_eq!(cluster.url().as_deref(), Some("https://old.example"));
        let global = fs::read_to_string(&legacy).unwrap();
        assert!(global.contains("reporting = true"));
        assert!(!global.contains("dcos_url"));
        assert!(registry.migrate_legacy(&legacy, &identify).unwrap().is_none());
    }
}

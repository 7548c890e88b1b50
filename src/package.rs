use crate::error::{DcosError, Result};
use crate::fsutil::{ensure_parent, remove_path, set_executable, unique_suffix};
use crate::http::HttpClient;
use reqwest::Method;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use url::Url;

const LIST_VERSIONS_REQUEST: &str =
    "application/vnd.dcos.package.list-versions-request+json;charset=utf-8;version=v1";
const LIST_VERSIONS_RESPONSE: &str =
    "application/vnd.dcos.package.list-versions-response+json;charset=utf-8;version=v1";
const DESCRIBE_REQUEST: &str =
    "application/vnd.dcos.package.describe-request+json;charset=utf-8;version=v1";
const DESCRIBE_RESPONSE: &str =
    "application/vnd.dcos.package.describe-response+json;charset=utf-8;version=v3";

pub const DEFAULT_DOWNLOAD_BASE: &str = "https://downloads.dcos.io/cli/releases/plugins";
const ENTERPRISE_DOWNLOAD_BASE: &str = "https://downloads.mesosphere.io/cli/releases/plugins";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ArtifactKind {
    #[serde(rename = "zip")]
    Zip,
    #[serde(rename = "tar.gz", alias = "tgz")]
    TarGz,
    #[serde(rename = "executable")]
    Executable,
}

impl ArtifactKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Zip => "zip",
            ArtifactKind::TarGz => "tar.gz",
            ArtifactKind::Executable => "executable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ContentHash {
    pub algo: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BinaryDescriptor {
    pub kind: ArtifactKind,
    pub url: String,
    #[serde(rename = "contentHash", default)]
    pub content_hash: Vec<ContentHash>,
}

impl BinaryDescriptor {
    /// The SHA-256 entry; plugin installs refuse artifacts without one.
    pub fn sha256(&self, package: &str) -> Result<&ContentHash> {
        if self.content_hash.is_empty() {
            return Err(DcosError::Integrity(format!(
                "'{package}' declares no content hash for {}",
                self.url
            )));
        }
        self.content_hash
            .iter()
            .find(|h| h.algo.eq_ignore_ascii_case("sha256"))
            .ok_or_else(|| {
                let algos: Vec<&str> = self.content_hash.iter().map(|h| h.algo.as_str()).collect();
                DcosError::Integrity(format!(
                    "unsupported content hash algorithm for '{package}': {}",
                    algos.join(", ")
                ))
            })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CliResource {
    #[serde(default)]
    binaries: BTreeMap<String, BTreeMap<String, BinaryDescriptor>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Resource {
    #[serde(default)]
    cli: Option<CliResource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PackageDefinition {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub maintainer: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    resource: Resource,
}

impl PackageDefinition {
    pub fn binary_for(&self, platform: &str, arch: &str) -> Result<&BinaryDescriptor> {
        self.resource
            .cli
            .as_ref()
            .and_then(|cli| cli.binaries.get(platform))
            .and_then(|arches| arches.get(arch))
            .ok_or_else(|| {
                DcosError::State(format!("'{}' isn't available for '{platform}'", self.name))
            })
    }
}

#[derive(Debug, Deserialize)]
struct DescribeResponse {
    package: PackageDefinition,
}

#[derive(Debug, Deserialize)]
struct ListVersionsResponse {
    #[serde(default)]
    results: BTreeMap<String, serde_json::Value>,
}

/// Platform name used in registry descriptors and download URLs.
pub fn host_platform() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}

pub fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => "arm64",
        _ => "x86-64",
    }
}

/// Rewrites the artifact scheme to the cluster's when both share a host.
pub fn align_scheme(artifact: &str, cluster: &Url) -> String {
    let Ok(mut url) = Url::parse(artifact) else {
        return artifact.to_string();
    };
    if url.host_str() == cluster.host_str() && url.scheme() != cluster.scheme() {
        if url.set_scheme(cluster.scheme()).is_err() {
            return artifact.to_string();
        }
        return url.to_string();
    }
    artifact.to_string()
}

pub struct PackageClient<'a> {
    http: &'a HttpClient<'a>,
}

impl<'a> PackageClient<'a> {
    pub fn new(http: &'a HttpClient<'a>) -> Self {
        PackageClient { http }
    }

    pub fn list_versions(&self, name: &str) -> Result<Vec<String>> {
        let response: ListVersionsResponse = self.http.post_json(
            "/package/list-versions",
            &serde_json::json!({"packageName": name, "includePackageVersions": true}),
            LIST_VERSIONS_REQUEST,
            LIST_VERSIONS_RESPONSE,
        )?;
        Ok(response.results.into_keys().collect())
    }

    pub fn describe(&self, name: &str, version: Option<&str>) -> Result<PackageDefinition> {
        let mut body = serde_json::json!({"packageName": name});
        if let Some(version) = version {
            body["packageVersion"] = serde_json::Value::String(version.to_string());
        }
        let response: DescribeResponse = self.http.post_json(
            "/package/describe",
            &body,
            DESCRIBE_REQUEST,
            DESCRIBE_RESPONSE,
        )?;
        Ok(response.package)
    }

    /// Checks the requested version against the registry; `None` keeps the registry default.
    pub fn resolve_version(&self, name: &str, requested: Option<&str>) -> Result<Option<String>> {
        let Some(requested) = requested else {
            return Ok(None);
        };
        let versions = self.list_versions(name)?;
        if versions.iter().any(|v| v == requested) {
            Ok(Some(requested.to_string()))
        } else {
            Err(DcosError::State(format!(
                "version '{requested}' of '{name}' is not available"
            )))
        }
    }

    /// Registry metadata and the host's artifact, scheme aligned with the cluster.
    pub fn artifact(&self, name: &str, version: Option<&str>) -> Result<Artifact> {
        let version = self.resolve_version(name, version)?;
        let package = self.describe(name, version.as_deref())?;
        let binary = package.binary_for(host_platform(), host_arch())?;
        let expected = binary.sha256(name)?.value.clone();
        let url = align_scheme(&binary.url, self.http.base_url());
        tracing::debug!("{} {} resolved to {}", package.name, package.version, url);
        Ok(Artifact {
            name: package.name.clone(),
            version: Some(package.version.clone()),
            url,
            kind: Some(binary.kind),
            sha256: Some(expected),
            source: format!("{}#{}@{}", self.http.base_url(), package.name, package.version),
        })
    }
}

/// A downloadable plugin artifact and what it must hash to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub version: Option<String>,
    pub url: String,
    pub kind: Option<ArtifactKind>,
    pub sha256: Option<String>,
    pub source: String,
}

/// `<base>/<name>/<platform>/x86-64/<name>-<major.minor>-patch.latest.zip`.
pub fn canonical_url(base: &str, name: &str, platform: &str, dcos_version: &str) -> Result<String> {
    let mut parts = dcos_version.split('.');
    let major = parts.next().filter(|p| p.chars().all(|c| c.is_ascii_digit()) && !p.is_empty());
    let minor = parts.next().map(|p| {
        p.chars()
            .take_while(|c| c.is_ascii_digit())
            .collect::<String>()
    });
    let (Some(major), Some(minor)) = (major, minor.filter(|m| !m.is_empty())) else {
        return Err(DcosError::State(format!(
            "unable to parse DC/OS version {dcos_version}"
        )));
    };
    Ok(format!(
        "{}/{name}/{platform}/x86-64/{name}-{major}.{minor}-patch.latest.zip",
        base.trim_end_matches('/')
    ))
}

/// Download root for canonical plugin archives, overridable for mirrors.
pub fn download_base(name: &str) -> String {
    if let Ok(base) = std::env::var("DCOS_PLUGIN_DOWNLOAD_BASE_URL") {
        if !base.trim().is_empty() {
            return base.trim().trim_end_matches('/').to_string();
        }
    }
    if name == "dcos-enterprise-cli" {
        ENTERPRISE_DOWNLOAD_BASE.to_string()
    } else {
        DEFAULT_DOWNLOAD_BASE.to_string()
    }
}

/// First 64-hex token of a `.sha256` sidecar (`<hash>  <file>` or bare hash).
pub fn parse_checksum(content: &str) -> Option<String> {
    for raw in content.split_whitespace() {
        let candidate = raw
            .trim_matches(|c: char| !c.is_ascii_hexdigit())
            .to_lowercase();
        if candidate.len() == 64 && candidate.chars().all(|c| c.is_ascii_hexdigit()) {
            return Some(candidate);
        }
    }
    None
}

struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn filename_from_disposition(value: &str) -> Option<String> {
    value.split(';').find_map(|part| {
        let (key, raw) = part.trim().split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("filename") {
            return None;
        }
        let name = raw.trim().trim_matches('"');
        Path::new(name)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .filter(|n| !n.is_empty())
    })
}

/// A downloaded file kept under its remote name.
#[derive(Debug)]
pub struct Download {
    pub path: PathBuf,
    pub sha256: String,
}

/// Streams `url` into `dir`, hashing while writing. A mismatch against `expected`
/// deletes the file.
pub fn download(http: &HttpClient<'_>, url: &str, dir: &Path, expected: Option<&str>) -> Result<Download> {
    let mut request = http.request(Method::GET, url)?;
    request.timeout = None;
    let url = request.url.to_string();
    let mut response = http.send(&request)?;
    let filename = response
        .headers()
        .get("content-disposition")
        .and_then(|v| v.to_str().ok())
        .and_then(filename_from_disposition)
        .or_else(|| {
            response
                .url()
                .path_segments()
                .and_then(|segments| segments.last().map(str::to_string))
                .filter(|s| !s.is_empty())
        })
        .unwrap_or_else(|| "plugin".to_string());

    let download_dir = dir.join(format!(".download-{}", unique_suffix()));
    fs::create_dir_all(&download_dir)?;
    let path = download_dir.join(&filename);
    let result = (|| -> Result<String> {
        let file = File::create(&path)?;
        let mut writer = HashingWriter {
            inner: file,
            hasher: Sha256::new(),
        };
        io::copy(&mut response, &mut writer).map_err(|err| DcosError::Transport {
            url: url.clone(),
            message: format!("download of {url} failed: {err}"),
        })?;
        writer.inner.sync_all()?;
        let computed = hex::encode(writer.hasher.finalize());
        if let Some(expected) = expected {
            let matches = hex::decode(expected.trim())
                .map(|bytes| hex::encode(bytes) == computed)
                .unwrap_or(false);
            if !matches {
                return Err(DcosError::Integrity(format!(
                    "computed checksum {computed} for {url}, expected {expected}"
                )));
            }
        }
        Ok(computed)
    })();
    match result {
        Ok(sha256) => {
            tracing::debug!("downloaded {url} to {} (sha256 {sha256})", path.display());
            Ok(Download { path, sha256 })
        }
        Err(err) => {
            let _ = remove_path(&download_dir);
            Err(err)
        }
    }
}

/// Fetches several artifacts at once, each through its own client; results keep the
/// input order.
pub fn download_all(jobs: &[(&HttpClient<'_>, Artifact)], dir: &Path) -> Vec<Result<Download>> {
    thread::scope(|scope| {
        let handles: Vec<_> = jobs
            .iter()
            .map(|(http, artifact)| {
                scope.spawn(move || download(http, &artifact.url, dir, artifact.sha256.as_deref()))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle.join().unwrap_or_else(|_| {
                    Err(DcosError::Process("download worker panicked".to_string()))
                })
            })
            .collect()
    })
}

/// Sniffs archive magic, falling back to the file name.
pub fn detect_kind(path: &Path) -> Result<ArtifactKind> {
    let mut magic = [0u8; 4];
    let read = File::open(path)?.read(&mut magic)?;
    if read >= 4 && magic == [b'P', b'K', 0x03, 0x04] {
        return Ok(ArtifactKind::Zip);
    }
    if read >= 2 && magic[..2] == [0x1f, 0x8b] {
        return Ok(ArtifactKind::TarGz);
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if name.ends_with(".zip") {
        Ok(ArtifactKind::Zip)
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Ok(ArtifactKind::TarGz)
    } else {
        Ok(ArtifactKind::Executable)
    }
}

/// Kind to unpack `path` as. A kind declared by the registry must match the file's contents.
pub fn checked_kind(declared: Option<ArtifactKind>, path: &Path) -> Result<ArtifactKind> {
    let sniffed = detect_kind(path)?;
    match declared {
        Some(declared) if declared != sniffed => Err(DcosError::Integrity(format!(
            "{} is declared as {} but its content is {}",
            path.display(),
            declared.as_str(),
            sniffed.as_str()
        ))),
        _ => Ok(sniffed),
    }
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut writer = HashingWriter {
        inner: io::sink(),
        hasher: Sha256::new(),
    };
    io::copy(&mut File::open(path)?, &mut writer)?;
    Ok(hex::encode(writer.hasher.finalize()))
}

fn run_tool(program: &str, args: &[&OsStr]) -> Result<()> {
    let tool = which::which(program).map_err(|_| {
        DcosError::Process(format!("{program} is required to unpack plugins but was not found in PATH"))
    })?;
    let output = Command::new(tool)
        .args(args)
        .output()
        .map_err(|err| DcosError::Process(format!("failed to run {program}: {err}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DcosError::Process(format!(
            "{program} failed with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(())
}

/// Lifts the contents of a lone top-level directory into `dest`.
fn hoist_single_dir(dest: &Path) -> Result<()> {
    let entries: Vec<_> = fs::read_dir(dest)?.collect::<io::Result<_>>()?;
    let [only] = entries.as_slice() else {
        return Ok(());
    };
    let inner = only.path();
    if !only.file_type()?.is_dir() || only.file_name() == "bin" {
        return Ok(());
    }
    let moved = dest.join(format!(".unpack-{}", unique_suffix()));
    fs::rename(&inner, &moved)?;
    for entry in fs::read_dir(&moved)? {
        let entry = entry?;
        fs::rename(entry.path(), dest.join(entry.file_name()))?;
    }
    fs::remove_dir(&moved)?;
    Ok(())
}

/// Binary file name a bare executable is installed under.
pub fn executable_name(plugin: &str) -> String {
    let base = if plugin.starts_with("dcos-") {
        plugin.to_string()
    } else {
        format!("dcos-{plugin}")
    };
    if cfg!(windows) && !base.ends_with(".exe") {
        format!("{base}.exe")
    } else {
        base
    }
}

/// Unpacks `archive` into the plugin tree at `dest`.
pub fn unpack(kind: ArtifactKind, archive: &Path, dest: &Path, plugin: &str) -> Result<()> {
    fs::create_dir_all(dest)?;
    match kind {
        ArtifactKind::Zip => {
            run_tool(
                "unzip",
                &[
                    OsStr::new("-q"),
                    OsStr::new("-o"),
                    archive.as_os_str(),
                    OsStr::new("-d"),
                    dest.as_os_str(),
                ],
            )?;
            hoist_single_dir(dest)
        }
        ArtifactKind::TarGz => {
            run_tool(
                "tar",
                &[
                    OsStr::new("-xzf"),
                    archive.as_os_str(),
                    OsStr::new("-C"),
                    dest.as_os_str(),
                ],
            )?;
            hoist_single_dir(dest)
        }
        ArtifactKind::Executable => {
            let target = dest.join("bin").join(executable_name(plugin));
            ensure_parent(&target)?;
            fs::copy(archive, &target)?;
            set_executable(&target)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::TlsTrust;
    use crate::testutil::{MockResponse, MockServer};
    use tempfile::tempdir;

    fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    fn client<'a>(url: &str) -> HttpClient<'a> {
        HttpClient::new(Url::parse(url).unwrap(), &TlsTrust::Insecure).unwrap()
    }

    fn registry(artifact_url: String, hash: String) -> MockServer {
        MockServer::start(move |req| match req.path.as_str() {
            "/package/list-versions" => MockResponse::json(
                200,
                serde_json::json!({"results": {"1.1.0": "1", "1.2.0": "2"}}),
            ),
            "/package/describe" => {
                let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
                let version = body["packageVersion"].as_str().unwrap_or("1.2.0").to_string();
                MockResponse::json(
                    200,
                    serde_json::json!({"package": {
                        "name": "dcos-core-cli",
                        "version": version,
                        "description": "core",
                        "resource": {"cli": {"binaries": {
                            host_platform(): {host_arch(): {
                                "kind": "zip",
                                "url": artifact_url,
                                "contentHash": [{"algo": "sha256", "value": hash}]
                            }}
                        }}}
                    }}),
                )
            }
            _ => MockResponse::bytes(404, b""),
        })
    }

    #[test]
    fn artifact_resolves_host_platform() {
        let server = registry("https://cdn.example/core.zip".to_string(), "ab".repeat(32));
        let http = client(&server.url);
        let artifact = PackageClient::new(&http)
            .artifact("dcos-core-cli", Some("1.1.0"))
            .unwrap();
        assert_eq!(artifact.url, "https://cdn.example/core.zip");
        assert_eq!(artifact.version.as_deref(), Some("1.1.0"));
        assert_eq!(artifact.kind, Some(ArtifactKind::Zip));
        let describe = server
            .requests()
            .into_iter()
            .find(|r| r.path == "/package/describe")
            .unwrap();
        assert_eq!(describe.headers["content-type"], DESCRIBE_REQUEST);
        assert_eq!(describe.headers["accept"], DESCRIBE_RESPONSE);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let server = registry("https://cdn.example/core.zip".to_string(), "ab".repeat(32));
        let http = client(&server.url);
        let err = PackageClient::new(&http)
            .artifact("dcos-core-cli", Some("9.9.9"))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "version '9.9.9' of 'dcos-core-cli' is not available"
        );
    }

    #[test]
    fn missing_platform_is_reported() {
        let package: PackageDefinition = serde_json::from_value(serde_json::json!({
            "name": "dcos-core-cli",
            "version": "1.0",
            "resource": {"cli": {"binaries": {"plan9": {"x86-64": {
                "kind": "executable", "url": "https://x/y", "contentHash": []
            }}}}}
        }))
        .unwrap();
        let err = package.binary_for("linux", "x86-64").unwrap_err();
        assert_eq!(err.to_string(), "'dcos-core-cli' isn't available for 'linux'");
        let binary = package.binary_for("plan9", "x86-64").unwrap();
        assert!(matches!(binary.sha256("dcos-core-cli"), Err(DcosError::Integrity(_))));
    }

    #[test]
    fn scheme_follows_cluster_for_same_host() {
        let cluster = Url::parse("https://cluster.example").unwrap();
        assert_eq!(
            align_scheme("http://cluster.example/package/resource?url=x", &cluster),
            "https://cluster.example/package/resource?url=x"
        );
        assert_eq!(
            align_scheme("http://cdn.example/core.zip", &cluster),
            "http://cdn.example/core.zip"
        );
    }

    #[test]
    fn download_verifies_checksum() {
        let payload = b"plugin-bytes".to_vec();
        let good = sha256_hex(&payload);
        let body = payload.clone();
        let server = MockServer::start(move |_| MockResponse::bytes(200, &body));
        let http = client(&server.url);
        let dir = tempdir().unwrap();

        let fetched = download(&http, "/core.zip", dir.path(), Some(&good)).unwrap();
        assert_eq!(fetched.sha256, good);
        assert_eq!(fetched.path.file_name().unwrap(), "core.zip");
        assert_eq!(fs::read(&fetched.path).unwrap(), payload);

        let wrong = "00".repeat(32);
        let err = download(&http, "/core.zip", dir.path(), Some(&wrong)).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!(
                "computed checksum {good} for {}/core.zip, expected {wrong}",
                server.url
            )
        );
        // Only the first, verified download remains.
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn concurrent_downloads_keep_order() {
        let server = MockServer::start(|req| MockResponse::bytes(200, req.path.as_bytes()));
        let http = client(&server.url);
        let dir = tempdir().unwrap();
        let jobs: Vec<(&HttpClient<'_>, Artifact)> = ["/a", "/b"]
            .iter()
            .map(|path| (&http, Artifact {
                name: path.trim_start_matches('/').to_string(),
                version: None,
                url: format!("{}{path}", server.url),
                kind: None,
                sha256: Some(sha256_hex(path.as_bytes())),
                source: path.to_string(),
            }))
            .collect();
        let results = download_all(&jobs, dir.path());
        let contents: Vec<Vec<u8>> = results
            .into_iter()
            .map(|r| fs::read(r.unwrap().path).unwrap())
            .collect();
        assert_eq!(contents, vec![b"/a".to_vec(), b"/b".to_vec()]);
    }

    #[test]
    fn canonical_url_uses_major_minor() {
        assert_eq!(
            canonical_url("https://downloads.example/plugins/", "dcos-core-cli", "linux", "2.1.0-beta").unwrap(),
            "https://downloads.example/plugins/dcos-core-cli/linux/x86-64/dcos-core-cli-2.1-patch.latest.zip"
        );
        assert!(canonical_url(DEFAULT_DOWNLOAD_BASE, "dcos-core-cli", "linux", "dev").is_err());
    }

    #[test]
    fn parse_checksum_reads_first_hash_token() {
        let hash = "ab".repeat(32);
        assert_eq!(
            parse_checksum(&format!("{hash}  dcos-core-cli.zip\n")),
            Some(hash.clone())
        );
        assert_eq!(parse_checksum("SHA256(x)= nothing"), None);
    }

    #[test]
    fn declared_kind_must_match_content() {
        let dir = tempdir().unwrap();
        let disguised = dir.path().join("dcos-core-cli.zip");
        fs::write(&disguised, [0x1f, 0x8b, 0x08, 0x00, 0x00]).unwrap();

        let err = checked_kind(Some(ArtifactKind::Zip), &disguised).unwrap_err();
        assert!(matches!(err, DcosError::Integrity(_)));
        assert!(err.to_string().contains("declared as zip but its content is tar.gz"));
        assert_eq!(
            checked_kind(Some(ArtifactKind::TarGz), &disguised).unwrap(),
            ArtifactKind::TarGz
        );
        assert_eq!(checked_kind(None, &disguised).unwrap(), ArtifactKind::TarGz);
    }

    #[test]
    fn file_hash_matches_streamed_hash() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("artifact");
        fs::write(&path, b"plugin-bytes").unwrap();
        assert_eq!(sha256_file(&path).unwrap(), sha256_hex(b"plugin-bytes"));
    }

    #[test]
    fn executable_is_unpacked_into_bin() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("tool");
        fs::write(&source, "#!/bin/sh\necho hi\n").unwrap();
        let dest = dir.path().join("tree");
        assert_eq!(detect_kind(&source).unwrap(), ArtifactKind::Executable);
        unpack(ArtifactKind::Executable, &source, &dest, "tool").unwrap();
        assert!(crate::fsutil::is_executable(&dest.join("bin").join(executable_name("tool"))));
    }

    #[test]
    fn tarball_with_top_dir_is_hoisted() {
        if which::which("tar").is_err() {
            return;
        }
        let dir = tempdir().unwrap();
        let src = dir.path().join("src").join("pkg").join("bin");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("dcos-hello"), "#!/bin/sh\n").unwrap();
        let archive = dir.path().join("pkg.tar.gz");
        let status = Command::new("tar")
            .arg("-czf")
            .arg(&archive)
            .arg("-C")
            .arg(dir.path().join("src"))
            .arg("pkg")
            .status()
            .unwrap();
        assert!(status.success());
        assert_eq!(detect_kind(&archive).unwrap(), ArtifactKind::TarGz);
        let dest = dir.path().join("tree");
        unpack(ArtifactKind::TarGz, &archive, &dest, "pkg").unwrap();
        assert!(dest.join("bin").join("dcos-hello").exists());
    }
}

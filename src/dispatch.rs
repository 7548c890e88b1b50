use crate::config::ConfigStore;
use crate::error::{DcosError, Result};
use crate::http::{HttpClient, TlsTrust};
use crate::logging::{verbosity_from_env, Verbosity};
use crate::plugin::VerbTarget;
use crate::setup::{fetch_version, DcosVersion, METADATA_TIMEOUT};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::{Command, ExitStatus};

/// Verbs handled in-process, with their help line.
pub const BUILTINS: &[(&str, &str)] = &[
    ("auth", "Authenticate to DC/OS cluster"),
    ("cluster", "Manage your DC/OS clusters"),
    ("config", "Manage the DC/OS configuration file"),
    ("help", "Help about any command"),
    ("plugin", "Manage CLI plugins"),
];

/// Verbs shipped by the core plugin; without a cluster they report the attach error.
const CORE_VERBS: &[&str] = &["job", "marathon", "node", "package", "service", "task"];

pub fn is_builtin(verb: &str) -> bool {
    BUILTINS.iter().any(|(name, _)| *name == verb)
}

pub fn is_core_verb(verb: &str) -> bool {
    CORE_VERBS.contains(&verb)
}

pub fn unknown_verb(verb: &str) -> DcosError {
    DcosError::Usage(format!("'{verb}' is not a dcos command."))
}

/// Options accepted before the verb. Everything from the first other token on
/// belongs to the verb and is never reinterpreted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalFlags {
    pub verbosity: usize,
    pub log_level: Option<String>,
    pub debug: bool,
    pub version: bool,
}

impl GlobalFlags {
    pub fn parse(args: &[String]) -> (GlobalFlags, Vec<String>) {
        let mut flags = GlobalFlags::default();
        let mut index = 0;
        while index < args.len() {
            match args[index].as_str() {
                "-v" => flags.verbosity = 1,
                "-vv" | "-vvv" => flags.verbosity = 2,
                "--version" => flags.version = true,
                "--debug" => flags.debug = true,
                "--log-level" => {
                    if let Some(level) = args.get(index + 1) {
                        flags.log_level = Some(level.clone());
                        index += 1;
                    }
                }
                other => match other.strip_prefix("--log-level=") {
                    Some(level) => flags.log_level = Some(level.to_string()),
                    None => break,
                },
            }
            index += 1;
        }
        (flags, args[index..].to_vec())
    }

    /// Effective verbosity plus the deprecation notices to print on stderr.
    pub fn resolve(&self, lookup: &dyn Fn(&str) -> Option<String>) -> (Verbosity, Vec<String>) {
        let mut notices = Vec::new();
        if self.debug {
            notices.push("The --debug flag is deprecated. Please use the -vv flag.".to_string());
        }
        if self.verbosity > 0 {
            return (Verbosity::from_count(self.verbosity), notices);
        }
        if self.debug {
            return (Verbosity::Debug, notices);
        }
        if let Some(level) = &self.log_level {
            match level.to_ascii_lowercase().as_str() {
                "debug" => {
                    notices.push(
                        "The --log-level flag is deprecated. Please use the -vv flag.".to_string(),
                    );
                    return (Verbosity::Debug, notices);
                }
                "info" => {
                    notices.push(
                        "The --log-level flag is deprecated. Please use the -v flag.".to_string(),
                    );
                    return (Verbosity::Info, notices);
                }
                "error" | "critical" | "warning" => {
                    notices.push(format!(
                        "The --log-level={level} flag is deprecated. It is enabled by default."
                    ));
                    return (Verbosity::Quiet, notices);
                }
                _ => tracing::debug!("ignoring unknown log level '{level}'"),
            }
        }
        (verbosity_from_env(lookup), notices)
    }
}

/// Top-level usage: built-ins and plugin verbs in one alphabetized list.
pub fn help_text(plugin_verbs: &BTreeMap<String, VerbTarget>) -> String {
    let mut commands: BTreeMap<&str, &str> = BUILTINS.iter().copied().collect();
    for (verb, target) in plugin_verbs {
        if is_builtin(verb) {
            continue;
        }
        commands.insert(verb.as_str(), target.command.description.as_str());
    }

    let mut text = String::from("Usage:\n  dcos [command]\n\nCommands:");
    for (name, short) in commands {
        text.push_str("\n  ");
        text.push_str(name);
        if !short.is_empty() {
            text.push_str("\n      ");
            text.push_str(short);
        }
    }
    text.push_str(
        "\n\nOptions:\n  --version\n      Print version information\n  -v, -vv\n      Output verbosity (verbose or very verbose)\n  -h, --help\n      Show usage help\n\nUse \"dcos [command] --help\" for more information about a command.",
    );
    text
}

/// Environment handed to a plugin on top of the inherited one.
pub fn child_env(
    store: Option<&ConfigStore>,
    verbosity: Verbosity,
    executable: &Path,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    if let Some(store) = store {
        env.extend(store.plugin_env());
    }
    env.insert(
        "DCOS_CLI_EXECUTABLE_PATH".to_string(),
        executable.display().to_string(),
    );
    if let Some((count, level)) = verbosity.child_env() {
        env.insert("DCOS_VERBOSITY".to_string(), count.to_string());
        env.insert("DCOS_LOG_LEVEL".to_string(), level.to_string());
    }
    let Some(store) = store else {
        return env;
    };
    let Ok(url) = store.dcos_url() else {
        return env;
    };
    env.insert(
        "DCOS_URL".to_string(),
        url.as_str().trim_end_matches('/').to_string(),
    );
    env.insert(
        "DCOS_ACS_TOKEN".to_string(),
        store.acs_token().unwrap_or_default(),
    );
    match TlsTrust::from_config(store, &url) {
        TlsTrust::Insecure => {
            env.insert("DCOS_TLS_INSECURE".to_string(), "1".to_string());
        }
        TlsTrust::CaBundle(path) => {
            env.insert("DCOS_TLS_CA_PATH".to_string(), path.display().to_string());
        }
        TlsTrust::System => {}
    }
    env
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

/// Runs the plugin command with stdio inherited; argv is `[verb, args...]`.
pub fn run_plugin(
    target: &VerbTarget,
    verb: &str,
    args: &[String],
    env: &BTreeMap<String, String>,
) -> Result<i32> {
    tracing::debug!(
        "running {} from plugin {}",
        target.executable.display(),
        target.plugin
    );
    let status = Command::new(&target.executable)
        .arg(verb)
        .args(args)
        .envs(env)
        .status()
        .map_err(|err| {
            DcosError::Process(format!(
                "couldn't run {}: {err}",
                target.executable.display()
            ))
        })?;
    let code = exit_code(status);
    if code != 0 {
        tracing::debug!("{verb} exited with {status}");
    }
    Ok(code)
}

/// `--version` output; cluster fields are only reported when one is attached.
pub fn version_lines(store: Option<&ConfigStore>) -> Vec<String> {
    let mut lines = vec![format!("dcoscli.version={}", env!("CARGO_PKG_VERSION"))];
    let Some(store) = store else {
        return lines;
    };
    let client = match HttpClient::from_config(store) {
        Ok(client) => client.with_timeout(METADATA_TIMEOUT),
        Err(err) => {
            tracing::debug!("couldn't build a client for the attached cluster: {err}");
            return lines;
        }
    };
    let version = fetch_version(&client).unwrap_or_else(|err| {
        tracing::debug!("couldn't read the cluster version: {err}");
        let unknown = "N/A".to_string();
        DcosVersion {
            version: unknown.clone(),
            variant: unknown.clone(),
            commit: unknown.clone(),
            bootstrap_id: unknown,
        }
    });
    lines.push(format!("dcos.version={}", version.version));
    lines.push(format!("dcos.variant={}", version.variant));
    lines.push(format!("dcos.commit={}", version.commit));
    lines.push(format!("dcos.bootstrap-id={}", version.bootstrap_id));
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigFile, EnvLayer};
    use crate::plugin::CommandSpec;
    use crate::testutil::{MockResponse, MockServer};
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    fn store_with(dir: &Path, cluster_toml: &str) -> ConfigStore {
        let cluster_path = dir.join("cluster.toml");
        std::fs::write(&cluster_path, cluster_toml).unwrap();
        ConfigStore::new(
            ConfigFile::empty(&dir.join("global.toml")),
            Some(ConfigFile::load(&cluster_path).unwrap()),
            EnvLayer::default(),
            dir.join(".lock"),
        )
    }

    fn target(verb: &str, description: &str) -> VerbTarget {
        VerbTarget {
            plugin: "dcos-core-cli".to_string(),
            command: CommandSpec {
                name: verb.to_string(),
                path: format!("bin/dcos-{verb}"),
                description: description.to_string(),
            },
            executable: PathBuf::from(format!("/plugins/bin/dcos-{verb}")),
        }
    }

    #[test]
    fn global_flags_stop_at_first_verb() {
        let (flags, rest) = GlobalFlags::parse(&args(&["-vv", "marathon", "-v", "app", "list"]));
        assert_eq!(flags.verbosity, 2);
        assert_eq!(rest, args(&["marathon", "-v", "app", "list"]));

        let (flags, rest) = GlobalFlags::parse(&args(&["--log-level", "info", "--version"]));
        assert_eq!(flags.log_level.as_deref(), Some("info"));
        assert!(flags.version);
        assert!(rest.is_empty());

        let (flags, rest) = GlobalFlags::parse(&args(&["--log-level=debug", "--help"]));
        assert_eq!(flags.log_level.as_deref(), Some("debug"));
        assert_eq!(rest, args(&["--help"]));
    }

    #[test]
    fn deprecated_flags_print_pointers() {
        let none = |_: &str| None;
        let (flags, _) = GlobalFlags::parse(&args(&["--debug"]));
        let (verbosity, notices) = flags.resolve(&none);
        assert_eq!(verbosity, Verbosity::Debug);
        assert_eq!(
            notices,
            vec!["The --debug flag is deprecated. Please use the -vv flag."]
        );

        let (flags, _) = GlobalFlags::parse(&args(&["--log-level=warning"]));
        let (verbosity, notices) = flags.resolve(&none);
        assert_eq!(verbosity, Verbosity::Quiet);
        assert_eq!(
            notices,
            vec!["The --log-level=warning flag is deprecated. It is enabled by default."]
        );

        let (flags, _) = GlobalFlags::parse(&args(&["--log-level", "info"]));
        assert_eq!(flags.resolve(&none).0, Verbosity::Info);
    }

    #[test]
    fn env_verbosity_applies_without_flags() {
        let env = |name: &str| (name == "DCOS_VERBOSITY").then(|| "2".to_string());
        let (flags, _) = GlobalFlags::parse(&args(&["auth"]));
        assert_eq!(flags.resolve(&env).0, Verbosity::Debug);

        let (flags, _) = GlobalFlags::parse(&args(&["-v", "auth"]));
        assert_eq!(flags.resolve(&env).0, Verbosity::Info);
    }

    #[test]
    fn help_lists_builtins_and_plugin_verbs_sorted() {
        let mut verbs = BTreeMap::new();
        verbs.insert("marathon".to_string(), target("marathon", "Deploy and manage applications"));
        verbs.insert("config".to_string(), target("config", "shadowed"));
        verbs.insert("job".to_string(), target("job", ""));
        let text = help_text(&verbs);

        assert!(text.starts_with("Usage:\n  dcos [command]\n\nCommands:\n  auth\n"));
        let order: Vec<&str> = text
            .lines()
            .filter(|line| line.starts_with("  ") && !line.starts_with("   "))
            .map(str::trim)
            .collect();
        assert_eq!(
            &order[..7],
            &["dcos [command]", "auth", "cluster", "config", "help", "job", "marathon"]
        );
        assert!(text.contains("  marathon\n      Deploy and manage applications"));
        assert!(!text.contains("shadowed"));
        assert!(text.ends_with("for more information about a command."));
    }

    #[test]
    fn child_env_carries_cluster_and_plugin_sections() {
        let dir = tempdir().unwrap();
        let store = store_with(
            dir.path(),
            "[core]\ndcos_url = \"http://cluster.example\"\ndcos_acs_token = \"T\"\n\n[marathon]\nurl = \"http://marathon.example\"\n",
        );
        let env = child_env(Some(&store), Verbosity::Debug, Path::new("/usr/local/bin/dcos"));
        assert_eq!(env["DCOS_URL"], "http://cluster.example");
        assert_eq!(env["DCOS_ACS_TOKEN"], "T");
        assert_eq!(env["DCOS_TLS_INSECURE"], "1");
        assert_eq!(env["DCOS_VERBOSITY"], "2");
        assert_eq!(env["DCOS_LOG_LEVEL"], "debug");
        assert_eq!(env["DCOS_MARATHON_URL"], "http://marathon.example");
        assert_eq!(env["DCOS_CLI_EXECUTABLE_PATH"], "/usr/local/bin/dcos");
        assert!(!env.contains_key("DCOS_CORE_DCOS_URL"));
    }

    #[test]
    fn child_env_points_at_ca_bundle() {
        let dir = tempdir().unwrap();
        let store = store_with(
            dir.path(),
            "[core]\ndcos_url = \"https://cluster.example\"\nssl_verify = \"/tmp/dcos_ca.crt\"\n",
        );
        let env = child_env(Some(&store), Verbosity::Quiet, Path::new("/bin/dcos"));
        assert_eq!(env["DCOS_TLS_CA_PATH"], "/tmp/dcos_ca.crt");
        assert!(!env.contains_key("DCOS_TLS_INSECURE"));
        assert!(!env.contains_key("DCOS_VERBOSITY"));
    }

    #[cfg(unix)]
    #[test]
    fn plugin_exit_codes_pass_through() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("dcos-fail");
        std::fs::write(&script, "#!/bin/sh\n[ \"$1\" = fail ] || exit 9\nexit 3\n").unwrap();
        crate::fsutil::set_executable(&script).unwrap();
        let mut target = target("fail", "");
        target.executable = script;
        assert_eq!(run_plugin(&target, "fail", &[], &BTreeMap::new()).unwrap(), 3);
        assert_eq!(run_plugin(&target, "other", &[], &BTreeMap::new()).unwrap(), 9);
    }

    #[test]
    fn version_reports_cluster_fields() {
        let server = MockServer::start(|req| match req.path.as_str() {
            "/dcos-metadata/dcos-version.json" => MockResponse::json(
                200,
                serde_json::json!({
                    "version": "2.1.0",
                    "dcos-variant": "open",
                    "dcos-image-commit": "abc123",
                    "bootstrap-id": "boot"
                }),
            ),
            _ => MockResponse::json(404, serde_json::json!({})),
        });
        let dir = tempdir().unwrap();
        let store = store_with(
            dir.path(),
            &format!("[core]\ndcos_url = \"{}\"\n", server.url),
        );
        let lines = version_lines(Some(&store));
        assert_eq!(lines[0], format!("dcoscli.version={}", env!("CARGO_PKG_VERSION")));
        assert_eq!(&lines[1..], &[
            "dcos.version=2.1.0",
            "dcos.variant=open",
            "dcos.commit=abc123",
            "dcos.bootstrap-id=boot",
        ]);
    }

    #[test]
    fn version_falls_back_to_na() {
        let server = MockServer::start(|_| MockResponse::json(404, serde_json::json!({})));
        let dir = tempdir().unwrap();
        let store = store_with(
            dir.path(),
            &format!("[core]\ndcos_url = \"{}\"\n", server.url),
        );
        let lines = version_lines(Some(&store));
        assert_eq!(lines.len(), 5);
        assert!(lines[1..].iter().all(|line| line.ends_with("=N/A")));
        assert_eq!(version_lines(None).len(), 1);
    }
}

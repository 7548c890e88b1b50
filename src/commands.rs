use crate::auth::{
    LoginFlags, LoginFlow, LoginOutcome, Prompter, TerminalPrompter, AUTH_DISABLED,
};
use crate::cluster::{Cluster, Registry, NOT_ATTACHED, NO_CLUSTERS};
use crate::config::{self, display_value, ConfigFile, ConfigStore, EnvLayer, ValueType, SCHEMA};
use crate::error::{DcosError, Result};
use crate::http::{HttpClient, Reauthenticate, TlsTrust};
use crate::logging::Verbosity;
use crate::plugin::{InstallOptions, PluginStore, Source};
use crate::setup::{fetch_cluster_id, fetch_version, Setup, SetupArgs, METADATA_TIMEOUT};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::env;
use std::thread;

#[derive(Parser, Debug)]
#[command(
    name = "dcos",
    about = "Command line interface for DC/OS clusters",
    disable_version_flag = true,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Authenticate to DC/OS cluster
    Auth {
        #[command(subcommand)]
        command: AuthCommand,
    },
    /// Manage your DC/OS clusters
    Cluster {
        #[command(subcommand)]
        command: ClusterCommand,
    },
    /// Manage the DC/OS configuration file
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Manage CLI plugins
    Plugin {
        #[command(subcommand)]
        command: PluginCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum AuthCommand {
    /// Log in to the current cluster
    Login(LoginFlags),
    /// Log out the CLI from the current cluster
    Logout,
    /// List the login providers of a cluster
    ListProviders {
        /// Cluster URL; defaults to the current cluster
        url: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum ClusterCommand {
    /// List the configured clusters
    List {
        /// Only show the attached cluster
        #[arg(long)]
        attached: bool,
        #[arg(long)]
        json: bool,
    },
    /// Attach the CLI to a cluster
    Attach { name: String },
    /// Rename a configured cluster
    Rename { name: String, new_name: String },
    /// Remove a configured cluster from the CLI
    Remove {
        name: Option<String>,
        #[arg(long)]
        all: bool,
        /// Remove every cluster that does not answer
        #[arg(long)]
        unavailable: bool,
    },
    /// Set up the CLI to communicate with a cluster
    Setup(SetupArgs),
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the configuration, or one property of it
    Show { name: Option<String> },
    /// Add or set a property in the configuration file used for the current cluster
    Set { name: String, value: String },
    /// Remove a property from the configuration file used for the current cluster
    Unset { name: String },
    /// Print all the keys that can be set in a configuration file
    Keys {
        /// Only print config keys
        #[arg(long, short = 'q')]
        quiet: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum PluginCommand {
    /// Add a CLI plugin from a directory, archive, executable or URL
    Add {
        resource: String,
        #[arg(long, short = 'u')]
        update: bool,
        /// Plugin name for a bare executable
        #[arg(long)]
        name: Option<String>,
    },
    /// Remove a CLI plugin
    Remove { name: String },
    /// List CLI plugins
    List {
        #[arg(long)]
        json: bool,
    },
}

/// Per-invocation state shared by the built-in verbs.
pub struct Context {
    pub registry: Registry,
    pub verbosity: Verbosity,
    selected: Option<String>,
}

impl Context {
    pub fn new(registry: Registry, verbosity: Verbosity) -> Self {
        Context {
            registry,
            verbosity,
            selected: env::var("DCOS_CLUSTER").ok().filter(|s| !s.trim().is_empty()),
        }
    }

    pub fn cluster(&self) -> Result<Cluster> {
        self.registry.current(self.selected.as_deref())
    }

    pub fn plugins(&self, cluster: &Cluster) -> PluginStore {
        PluginStore::new(&cluster.plugins_dir(), &self.registry.lock_path())
    }

    /// Layered config for `cluster` (or the global layer alone), environment included.
    pub fn store(&self, cluster: Option<&Cluster>) -> Result<ConfigStore> {
        self.store_with_env(cluster, EnvLayer::from_env())
    }

    fn store_with_env(&self, cluster: Option<&Cluster>, env: EnvLayer) -> Result<ConfigStore> {
        let global = ConfigFile::load(&self.registry.global_config_path())?;
        let mut sections = Vec::new();
        if let Some(cluster) = cluster {
            for plugin in self.plugins(cluster).list()? {
                sections.push(plugin.name().to_string());
                sections.extend(plugin.verbs().into_iter().map(str::to_string));
            }
        }
        let store = ConfigStore::new(
            global,
            cluster.map(|c| c.config().clone()),
            env,
            self.registry.lock_path(),
        );
        Ok(store.with_plugin_sections(sections))
    }
}

/// Logs in again when a token-bearing request is rejected, then persists the new token.
struct InteractiveReauth<'a> {
    ctx: &'a Context,
    cluster: Cluster,
}

impl Reauthenticate for InteractiveReauth<'_> {
    fn reauthenticate(&self) -> Result<String> {
        let prompter = TerminalPrompter;
        if !prompter.interactive() {
            return Err(DcosError::Auth(
                "your session has expired, please run `dcos auth login`".to_string(),
            ));
        }
        eprintln!("Your session has expired, please log in again.");
        let mut store = self.ctx.store(Some(&self.cluster))?;
        let client = HttpClient::from_config(&store)?.with_token(None);
        let credentials = LoginFlags::default().resolve()?;
        match LoginFlow::new(&client, &prompter, credentials).run()? {
            LoginOutcome::Token(token) => {
                store.set(config::ACS_TOKEN, &token)?;
                Ok(token)
            }
            LoginOutcome::AuthDisabled => Err(DcosError::Auth(
                "the cluster rejected the request although it does not require authentication"
                    .to_string(),
            )),
        }
    }
}

/// Client for the cluster of `store`, re-authenticating on 401 unless `core.prompt_login` is off.
fn cluster_client<'r>(
    store: &ConfigStore,
    reauth: &'r InteractiveReauth<'_>,
) -> Result<HttpClient<'r>> {
    let client = HttpClient::from_config(store)?;
    if store.get_bool(config::PROMPT_LOGIN) == Some(false) {
        return Ok(client);
    }
    Ok(client.with_reauth(reauth))
}

pub fn run(ctx: &Context, command: Commands) -> Result<()> {
    match command {
        Commands::Auth { command } => handle_auth(ctx, command),
        Commands::Cluster { command } => handle_cluster(ctx, command),
        Commands::Config { command } => handle_config(ctx, command),
        Commands::Plugin { command } => handle_plugin(ctx, command),
    }
}

fn print_json<T: Serialize>(payload: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}

/// Left-aligned columns separated by two spaces.
fn render_table(header: &[&str], rows: &[Vec<String>]) -> Vec<String> {
    let mut widths: Vec<usize> = header.iter().map(|h| h.len()).collect();
    for row in rows {
        for (index, cell) in row.iter().enumerate() {
            if let Some(width) = widths.get_mut(index) {
                *width = (*width).max(cell.chars().count());
            }
        }
    }
    let header_row: Vec<String> = header.iter().map(|h| h.to_string()).collect();
    std::iter::once(&header_row)
        .chain(rows.iter())
        .map(|row| {
            row.iter()
                .zip(&widths)
                .map(|(cell, width)| format!("{cell:<width$}"))
                .collect::<Vec<_>>()
                .join("  ")
                .trim_end()
                .to_string()
        })
        .collect()
}

fn print_table(header: &[&str], rows: &[Vec<String>]) {
    for line in render_table(header, rows) {
        println!("{line}");
    }
}

fn handle_auth(ctx: &Context, command: AuthCommand) -> Result<()> {
    match command {
        AuthCommand::Login(flags) => login(ctx, &flags),
        AuthCommand::Logout => {
            let cluster = ctx.cluster()?;
            let mut store = ctx.store(Some(&cluster))?;
            let has_token = store
                .cluster_file()
                .and_then(|file| file.get(config::ACS_TOKEN))
                .is_some();
            if has_token {
                store.unset(config::ACS_TOKEN)?;
            }
            eprintln!("Logout successful");
            Ok(())
        }
        AuthCommand::ListProviders { url, json } => list_providers(ctx, url, json),
    }
}

fn login(ctx: &Context, flags: &LoginFlags) -> Result<()> {
    let cluster = ctx.cluster()?;
    let mut store = ctx.store(Some(&cluster))?;
    let client = HttpClient::from_config(&store)?.with_token(None);
    let credentials = flags.resolve()?;
    let token = match LoginFlow::new(&client, &TerminalPrompter, credentials).run()? {
        LoginOutcome::Token(token) => token,
        LoginOutcome::AuthDisabled => {
            eprintln!("{AUTH_DISABLED}");
            return Ok(());
        }
    };

    let reported = fetch_cluster_id(&client)?;
    if reported != cluster.id() {
        return Err(DcosError::Integrity(format!(
            "cluster ID mismatch: {} reports '{reported}' but the current cluster is '{}'",
            client.base_url().as_str().trim_end_matches('/'),
            cluster.id()
        )));
    }
    store.set(config::ACS_TOKEN, &token)?;
    tracing::info!("logged in to {}", cluster.name());
    Ok(())
}

fn list_providers(ctx: &Context, url: Option<String>, json: bool) -> Result<()> {
    let client = match url {
        Some(raw) => {
            let url = config::validate_url(raw.trim().trim_end_matches('/'))?;
            let trust = if url.scheme() == "http" {
                TlsTrust::Insecure
            } else {
                TlsTrust::System
            };
            HttpClient::new(url, &trust)?
        }
        None => HttpClient::from_config(&ctx.store(Some(&ctx.cluster()?))?)?.with_token(None),
    };
    let credentials = LoginFlags::default().resolve()?;
    let flow = LoginFlow::new(&client, &TerminalPrompter, credentials);
    let Some(providers) = flow.providers()? else {
        eprintln!("This cluster does not require authenticated requests.");
        return Ok(());
    };

    if json {
        let mut map = serde_json::Map::new();
        for provider in &providers {
            map.insert(provider.id.clone(), serde_json::to_value(provider)?);
        }
        return print_json(&map);
    }
    let rows: Vec<Vec<String>> = providers
        .iter()
        .map(|p| vec![p.id.clone(), p.login_method()])
        .collect();
    print_table(&["PROVIDER ID", "LOGIN METHOD"], &rows);
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
struct ClusterInfo {
    attached: bool,
    id: String,
    name: String,
    status: String,
    url: String,
    version: String,
}

/// Probes `/dcos-metadata/dcos-version.json` of every cluster concurrently.
fn cluster_infos(ctx: &Context, clusters: &[Cluster], attached_id: Option<&str>) -> Vec<ClusterInfo> {
    thread::scope(|scope| {
        let handles: Vec<_> = clusters
            .iter()
            .map(|cluster| {
                scope.spawn(move || {
                    let mut info = ClusterInfo {
                        attached: attached_id == Some(cluster.id()),
                        id: cluster.id().to_string(),
                        name: cluster.name(),
                        status: "UNAVAILABLE".to_string(),
                        url: cluster.url().unwrap_or_default(),
                        version: "UNKNOWN".to_string(),
                    };
                    let probed = ctx
                        .store_with_env(Some(cluster), EnvLayer::default())
                        .and_then(|store| HttpClient::from_config(&store))
                        .and_then(|client| fetch_version(&client.with_timeout(METADATA_TIMEOUT)));
                    match probed {
                        Ok(version) => {
                            info.status = "AVAILABLE".to_string();
                            info.version = version.version;
                        }
                        Err(err) => tracing::info!("{} is unavailable: {err}", cluster.name()),
                    }
                    info
                })
            })
            .collect();
        handles
            .into_iter()
            .zip(clusters)
            .map(|(handle, cluster)| {
                handle.join().unwrap_or_else(|_| ClusterInfo {
                    attached: attached_id == Some(cluster.id()),
                    id: cluster.id().to_string(),
                    name: cluster.name(),
                    status: "UNAVAILABLE".to_string(),
                    url: cluster.url().unwrap_or_default(),
                    version: "UNKNOWN".to_string(),
                })
            })
            .collect()
    })
}

fn handle_cluster(ctx: &Context, command: ClusterCommand) -> Result<()> {
    match command {
        ClusterCommand::List { attached, json } => {
            let current = ctx.cluster().ok();
            let clusters = if attached {
                vec![current
                    .clone()
                    .ok_or_else(|| DcosError::State(NOT_ATTACHED.to_string()))?]
            } else {
                ctx.registry.list()?
            };
            if clusters.is_empty() {
                return Err(DcosError::State(NO_CLUSTERS.to_string()));
            }
            let infos = cluster_infos(ctx, &clusters, current.as_ref().map(|c| c.id()));
            if json {
                return print_json(&infos);
            }
            let rows: Vec<Vec<String>> = infos
                .into_iter()
                .map(|info| {
                    vec![
                        if info.attached { "*" } else { "" }.to_string(),
                        info.name,
                        info.id,
                        info.status,
                        info.version,
                        info.url,
                    ]
                })
                .collect();
            print_table(&["", "NAME", "ID", "STATUS", "VERSION", "URL"], &rows);
            Ok(())
        }
        ClusterCommand::Attach { name } => {
            let cluster = ctx.registry.find(&name)?;
            if !ctx.registry.attach(&cluster)? {
                tracing::info!("{} is already attached", cluster.name());
            }
            Ok(())
        }
        ClusterCommand::Rename { name, new_name } => {
            let old = ctx.registry.rename(&name, &new_name)?;
            eprintln!("Renamed {old} to {new_name}");
            Ok(())
        }
        ClusterCommand::Remove {
            name,
            all,
            unavailable,
        } => remove_clusters(ctx, name, all, unavailable),
        ClusterCommand::Setup(args) => {
            let lookup = |name: &str| env::var(name).ok();
            let report = Setup::new(&ctx.registry, &TerminalPrompter, &lookup).run(&args)?;
            if !report.new_commands.is_empty() {
                eprintln!("New commands available: {}", report.new_commands.join(", "));
            }
            eprintln!("{} is now setup", report.url);
            tracing::debug!("cluster {} stored in {}", report.cluster.id(), report.cluster.dir().display());
            Ok(())
        }
    }
}

fn remove_clusters(ctx: &Context, name: Option<String>, all: bool, unavailable: bool) -> Result<()> {
    match (name, all || unavailable) {
        (Some(_), true) => Err(DcosError::Usage(
            "cannot accept both a cluster name and the --all / --unavailable option".to_string(),
        )),
        (None, false) => Err(DcosError::Usage(
            "either a cluster name or one of the --all / --unavailable option must be passed"
                .to_string(),
        )),
        (Some(name), false) => {
            let removed = ctx.registry.remove(&name)?;
            eprintln!("Removed cluster: {removed}");
            Ok(())
        }
        (None, true) if all => {
            for removed in ctx.registry.remove_all()? {
                eprintln!("Removed cluster: {removed}");
            }
            Ok(())
        }
        (None, true) => {
            let clusters = ctx.registry.list()?;
            for info in cluster_infos(ctx, &clusters, None) {
                if info.status == "UNAVAILABLE" {
                    let removed = ctx.registry.remove(&info.id)?;
                    eprintln!("Removed cluster: {removed}");
                }
            }
            Ok(())
        }
    }
}

fn value_type_name(kind: ValueType) -> &'static str {
    match kind {
        ValueType::String => "string",
        ValueType::Secret => "secret string",
        ValueType::Bool => "boolean",
        ValueType::Integer => "integer",
        ValueType::Url => "url",
        ValueType::BoolOrPath => "boolean or path to a CA bundle",
    }
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<()> {
    let cluster = ctx.cluster().ok();
    match command {
        ConfigCommand::Show { name: None } => {
            for line in ctx.store(cluster.as_ref())?.show() {
                println!("{line}");
            }
            Ok(())
        }
        ConfigCommand::Show { name: Some(name) } => {
            match ctx.store(cluster.as_ref())?.get(&name)? {
                Some(value) => {
                    println!("{}", display_value(&value));
                    Ok(())
                }
                None => Err(DcosError::Config(format!("Property '{name}' doesn't exist"))),
            }
        }
        ConfigCommand::Set { name, value } => {
            let outcome = ctx.store(cluster.as_ref())?.set(&name, &value)?;
            for message in outcome.messages {
                eprintln!("{message}");
            }
            Ok(())
        }
        ConfigCommand::Unset { name } => {
            let message = ctx.store(cluster.as_ref())?.unset(&name)?;
            eprintln!("{message}");
            Ok(())
        }
        ConfigCommand::Keys { quiet } => {
            let mut keys: Vec<_> = SCHEMA.iter().collect();
            keys.sort_by_key(|spec| spec.path);
            for spec in keys {
                if quiet {
                    println!("{}", spec.path);
                } else {
                    println!("{} : {}", spec.path, value_type_name(spec.kind));
                }
            }
            Ok(())
        }
    }
}

fn handle_plugin(ctx: &Context, command: PluginCommand) -> Result<()> {
    let cluster = ctx.cluster()?;
    let plugins = ctx.plugins(&cluster);
    match command {
        PluginCommand::Add {
            resource,
            update,
            name,
        } => {
            let source = Source::parse(&resource);
            let options = InstallOptions {
                name,
                update,
                ..InstallOptions::default()
            };
            let plugin = match &source {
                Source::Url(_) => {
                    let store = ctx.store(Some(&cluster))?;
                    let reauth = InteractiveReauth {
                        ctx,
                        cluster: cluster.clone(),
                    };
                    let client = cluster_client(&store, &reauth)?;
                    plugins.install(&source, &options, Some(&client))?
                }
                Source::Path(_) => plugins.install(&source, &options, None)?,
            };
            eprintln!("New commands available: {}", plugin.verbs().join(", "));
            Ok(())
        }
        PluginCommand::Remove { name } => {
            plugins.remove(&name)?;
            eprintln!("Removed {name} as a plugin from the CLI");
            Ok(())
        }
        PluginCommand::List { json } => {
            let installed = plugins.list()?;
            if json {
                let records: Vec<serde_json::Value> = installed.iter().map(|p| p.to_json()).collect();
                return print_json(&records);
            }
            let rows: Vec<Vec<String>> = installed
                .iter()
                .map(|plugin| {
                    let mut verbs = plugin.verbs();
                    verbs.sort();
                    vec![plugin.name().to_string(), verbs.join(" ")]
                })
                .collect();
            print_table(&["NAME", "COMMANDS"], &rows);
            Ok(())
        }
    }
}

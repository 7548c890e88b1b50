mod auth;
mod cluster;
mod commands;
mod config;
mod dispatch;
mod error;
mod fsutil;
mod http;
mod logging;
mod package;
mod plugin;
mod setup;
#[cfg(test)]
mod testutil;

use clap::error::ErrorKind;
use clap::Parser;
use cluster::Registry;
use commands::{Cli, Context};
use config::{ConfigFile, ConfigStore, EnvLayer};
use dispatch::GlobalFlags;
use error::Result;
use http::HttpClient;
use logging::Verbosity;
use std::env;
use std::error::Error as _;
use std::fs;
use std::path::PathBuf;

fn main() {
    let raw_args: Vec<String> = env::args().skip(1).collect();
    let (flags, args) = GlobalFlags::parse(&raw_args);
    let lookup = |name: &str| env::var(name).ok();
    let (verbosity, notices) = flags.resolve(&lookup);
    for notice in notices {
        eprintln!("{notice}");
    }
    logging::init(verbosity);

    match run(&flags, &args, verbosity) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err}");
            if verbosity == Verbosity::Debug {
                let mut source = err.source();
                while let Some(cause) = source {
                    eprintln!("  caused by: {cause}");
                    source = cause.source();
                }
            }
            std::process::exit(1);
        }
    }
}

fn run(flags: &GlobalFlags, args: &[String], verbosity: Verbosity) -> Result<i32> {
    let registry = Registry::new(&cluster::cli_dir()?);
    migrate_legacy(&registry);
    let ctx = Context::new(registry, verbosity);

    if flags.version {
        let store = ctx.cluster().ok().and_then(|c| ctx.store(Some(&c)).ok());
        for line in dispatch::version_lines(store.as_ref()) {
            println!("{line}");
        }
        return Ok(0);
    }

    let Some((verb, rest)) = args.split_first() else {
        print_help(&ctx);
        return Ok(0);
    };
    match verb.as_str() {
        "-h" | "--help" => {
            print_help(&ctx);
            Ok(0)
        }
        "help" => match rest.first() {
            None => {
                print_help(&ctx);
                Ok(0)
            }
            Some(topic) if dispatch::is_builtin(topic) => {
                Ok(parse_builtin(["dcos", topic.as_str(), "--help"]).err().unwrap_or(0))
            }
            Some(topic) => run_plugin_verb(&ctx, topic, &["--help".to_string()]),
        },
        builtin if dispatch::is_builtin(builtin) => {
            let argv = std::iter::once("dcos").chain(args.iter().map(String::as_str));
            match parse_builtin(argv) {
                Ok(cli) => {
                    commands::run(&ctx, cli.command)?;
                    Ok(0)
                }
                Err(code) => Ok(code),
            }
        }
        _ => run_plugin_verb(&ctx, verb, rest),
    }
}

/// Parses a built-in command line; on failure clap's output is printed and the exit code returned.
/// Requested help exits 0, any usage error exits 1.
fn parse_builtin<'a>(argv: impl IntoIterator<Item = &'a str>) -> std::result::Result<Cli, i32> {
    Cli::try_parse_from(argv).map_err(|err| {
        let _ = err.print();
        match err.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
            _ => 1,
        }
    })
}

fn print_help(ctx: &Context) {
    let verbs = ctx
        .cluster()
        .and_then(|cluster| ctx.plugins(&cluster).verbs())
        .unwrap_or_default();
    println!("{}", dispatch::help_text(&verbs));
}

fn run_plugin_verb(ctx: &Context, verb: &str, args: &[String]) -> Result<i32> {
    let cluster = match ctx.cluster() {
        Ok(cluster) => cluster,
        Err(err) if dispatch::is_core_verb(verb) => return Err(err),
        Err(err) => {
            tracing::debug!("no current cluster: {err}");
            return Err(dispatch::unknown_verb(verb));
        }
    };
    let target = ctx
        .plugins(&cluster)
        .resolve(verb)?
        .ok_or_else(|| dispatch::unknown_verb(verb))?;
    let store = ctx.store(Some(&cluster))?;
    let executable = env::current_exe()?;
    let executable = fs::canonicalize(&executable).unwrap_or(executable);
    let child_env = dispatch::child_env(Some(&store), ctx.verbosity, &executable);
    dispatch::run_plugin(&target, verb, args, &child_env)
}

/// Turns a pre-cluster config (DCOS_CONFIG or the global file) into a cluster record.
fn migrate_legacy(registry: &Registry) {
    let legacy = match env::var("DCOS_CONFIG") {
        Ok(path) if !path.trim().is_empty() => {
            tracing::warn!(
                "DCOS_CONFIG is deprecated, please consider using `dcos cluster setup <dcos_url>`."
            );
            PathBuf::from(path)
        }
        _ => registry.global_config_path(),
    };
    let identify = |legacy: &ConfigFile| -> Result<String> {
        let store = ConfigStore::new(
            legacy.clone(),
            None,
            EnvLayer::default(),
            registry.lock_path(),
        );
        let client = HttpClient::from_config(&store)?.with_timeout(setup::METADATA_TIMEOUT);
        setup::fetch_cluster_id(&client)
    };
    match registry.migrate_legacy(&legacy, &identify) {
        Ok(Some(cluster)) => tracing::debug!("migrated legacy config into {}", cluster.dir().display()),
        Ok(None) => {}
        Err(err) => tracing::warn!("couldn't migrate legacy config {}: {err}", legacy.display()),
    }
}

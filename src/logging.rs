use std::io;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
    #[default]
    Quiet,
    Info,
    Debug,
}

impl Verbosity {
    pub fn from_count(count: usize) -> Self {
        match count {
            0 => Verbosity::Quiet,
            1 => Verbosity::Info,
            _ => Verbosity::Debug,
        }
    }

    /// Maps `--log-level` / `DCOS_LOG_LEVEL` values. Levels above info stay quiet.
    pub fn from_log_level(level: &str) -> Option<Self> {
        match level.trim().to_ascii_lowercase().as_str() {
            "debug" => Some(Verbosity::Debug),
            "info" => Some(Verbosity::Info),
            "warning" | "warn" | "error" | "critical" => Some(Verbosity::Quiet),
            _ => None,
        }
    }

    /// Value exported to plugins as DCOS_VERBOSITY / DCOS_LOG_LEVEL.
    pub fn child_env(self) -> Option<(&'static str, &'static str)> {
        match self {
            Verbosity::Quiet => None,
            Verbosity::Info => Some(("1", "info")),
            Verbosity::Debug => Some(("2", "debug")),
        }
    }

    fn filter(self) -> &'static str {
        match self {
            Verbosity::Quiet => "warn",
            Verbosity::Info => "info",
            Verbosity::Debug => "debug",
        }
    }
}

/// Resolves the verbosity when no global flag raised it.
pub fn verbosity_from_env(lookup: &dyn Fn(&str) -> Option<String>) -> Verbosity {
    if let Some(raw) = lookup("DCOS_VERBOSITY") {
        if let Ok(count) = raw.trim().parse::<usize>() {
            return Verbosity::from_count(count);
        }
    }
    lookup("DCOS_LOG_LEVEL")
        .and_then(|level| Verbosity::from_log_level(&level))
        .unwrap_or_default()
}

pub fn init(verbosity: Verbosity) {
    // Only our own crate logs at the raised level; dependencies stay at warn.
    let directive = format!("warn,dcos={}", verbosity.filter());
    let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .without_time()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_counts_cap_at_debug() {
        assert_eq!(Verbosity::from_count(0), Verbosity::Quiet);
        assert_eq!(Verbosity::from_count(1), Verbosity::Info);
        assert_eq!(Verbosity::from_count(3), Verbosity::Debug);
    }

    #[test]
    fn log_levels_map_to_verbosity() {
        assert_eq!(Verbosity::from_log_level("DEBUG"), Some(Verbosity::Debug));
        assert_eq!(Verbosity::from_log_level("info"), Some(Verbosity::Info));
        assert_eq!(Verbosity::from_log_level("critical"), Some(Verbosity::Quiet));
        assert_eq!(Verbosity::from_log_level("loud"), None);
    }

    #[test]
    fn env_verbosity_prefers_dcos_verbosity() {
        let both = |name: &str| match name {
            "DCOS_VERBOSITY" => Some("1".to_string()),
            "DCOS_LOG_LEVEL" => Some("debug".to_string()),
            _ => None,
        };
        assert_eq!(verbosity_from_env(&both), Verbosity::Info);
        let level_only = |name: &str| (name == "DCOS_LOG_LEVEL").then(|| "debug".to_string());
        assert_eq!(verbosity_from_env(&level_only), Verbosity::Debug);
        assert_eq!(verbosity_from_env(&|_| None), Verbosity::Quiet);
    }

    #[test]
    fn child_env_only_when_raised() {
        assert_eq!(Verbosity::Quiet.child_env(), None);
        assert_eq!(Verbosity::Debug.child_env(), Some(("2", "debug")));
    }
}

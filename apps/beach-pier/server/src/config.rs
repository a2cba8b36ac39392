use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use beach_pier_core::{RawPreferenceKeys, TerminalPreferences};
use clap::Parser;
use serde::Deserialize;
use tracing::warn;

use crate::remote::{BackendKind, Target};
use crate::title::TitleTemplate;

pub const DEFAULT_TITLE_FORMAT: &str = "TTY - {{ .Command }}";
pub const DEFAULT_RECONNECT_SECS: u64 = 10;
const DEFAULT_PIPE_CAPACITY: usize = 64;
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Parser)]
#[command(
    name = "beach-pier",
    author,
    version,
    about = "Browser terminal bridge into container shells"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "BEACH_PIER_ADDRESS", default_value = "0.0.0.0")]
    pub address: String,

    /// Port to listen on.
    #[arg(long, env = "BEACH_PIER_PORT", default_value_t = 8080)]
    pub port: u16,

    /// TOML file with title format, reconnect and terminal preferences.
    #[arg(long, env = "BEACH_PIER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory of static assets (the browser client) served at `/`.
    #[arg(long, env = "BEACH_PIER_STATIC_DIR")]
    pub static_dir: Option<PathBuf>,

    /// Window title template, e.g. "TTY - {{ .Command }}".
    #[arg(long, env = "BEACH_PIER_TITLE_FORMAT")]
    pub title_format: Option<String>,

    /// Ask clients to reconnect after the connection drops.
    #[arg(long, env = "BEACH_PIER_ENABLE_RECONNECT", default_value_t = false)]
    pub enable_reconnect: bool,

    /// Seconds clients wait before reconnecting.
    #[arg(long, env = "BEACH_PIER_RECONNECT_TIME")]
    pub reconnect_time: Option<u64>,

    /// Container runtime to exec into.
    #[arg(long, env = "BEACH_PIER_BACKEND", value_enum, default_value_t = BackendKind::Kubernetes)]
    pub backend: BackendKind,

    /// Command started inside the container.
    #[arg(long, env = "BEACH_PIER_COMMAND", default_value = "/bin/bash", num_args = 1.., value_delimiter = ' ')]
    pub command: Vec<String>,

    /// Namespace used when the client does not send one.
    #[arg(long, env = "BEACH_PIER_NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Pod used when the client does not send one.
    #[arg(long, env = "BEACH_PIER_POD")]
    pub pod: Option<String>,

    /// Container used when the client does not send one.
    #[arg(long, env = "BEACH_PIER_CONTAINER")]
    pub container: Option<String>,

    /// Docker daemon address passed to `docker -H`.
    #[arg(long, env = "BEACH_PIER_DOCKER_HOST")]
    pub docker_host: Option<String>,

    /// Kubernetes API server passed to `kubectl --server`.
    #[arg(long, env = "BEACH_PIER_KUBE_SERVER")]
    pub kube_server: Option<String>,

    #[arg(long, env = "BEACH_PIER_DOCKER_BIN", default_value = "docker")]
    pub docker_bin: String,

    #[arg(long, env = "BEACH_PIER_KUBECTL_BIN", default_value = "kubectl")]
    pub kubectl_bin: String,

    /// TERM exported to the remote shell.
    #[arg(long, env = "BEACH_PIER_TERM", default_value = "xterm-256color")]
    pub term: String,

    /// Seconds to wait after client input closes before hanging up the remote command.
    #[arg(long, env = "BEACH_PIER_HANGUP_GRACE_SECS", default_value_t = 2)]
    pub hangup_grace_secs: u64,

    /// Seconds teardown waits for the client side to finish before dropping it.
    #[arg(long, env = "BEACH_PIER_DRAIN_TIMEOUT_SECS", default_value_t = DEFAULT_DRAIN_TIMEOUT_SECS)]
    pub drain_timeout_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_PIER_SHUTDOWN_GRACE_SECS", default_value_t = 1)]
    pub shutdown_grace_secs: u64,
}

/// Contents of the optional `--config` file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    title_format: Option<String>,
    enable_reconnect: Option<bool>,
    reconnect_time: Option<u64>,
    preferences: Option<toml::Table>,
}

/// Everything a session bridge reads. Shared read-only across sessions.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub title: TitleTemplate,
    /// Reconnect interval in seconds, `None` when reconnect is disabled.
    pub reconnect: Option<u64>,
    pub preferences: TerminalPreferences,
    pub raw_preference_keys: RawPreferenceKeys,
    pub pipe_capacity: usize,
    pub drain_timeout: Duration,
}

impl SessionSettings {
    pub fn new(title: TitleTemplate) -> Self {
        Self {
            title,
            reconnect: None,
            preferences: TerminalPreferences::default(),
            raw_preference_keys: RawPreferenceKeys::default(),
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            drain_timeout: Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub command: Vec<String>,
    pub term: String,
    pub docker_bin: String,
    pub docker_host: Option<String>,
    pub kubectl_bin: String,
    pub kube_server: Option<String>,
    pub hangup_grace: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Kubernetes,
            command: vec!["/bin/bash".to_string()],
            term: "xterm-256color".to_string(),
            docker_bin: "docker".to_string(),
            docker_host: None,
            kubectl_bin: "kubectl".to_string(),
            kube_server: None,
            hangup_grace: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub static_dir: Option<PathBuf>,
    pub default_target: Target,
    pub backend: BackendConfig,
    pub session: Arc<SessionSettings>,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = format!("{}:{}", cli.address, cli.port)
            .parse()
            .with_context(|| format!("invalid listen address: {}:{}", cli.address, cli.port))?;

        let file = match &cli.config {
            Some(path) => load_file(path)?,
            None => FileConfig::default(),
        };

        let title_format = cli
            .title_format
            .or(file.title_format)
            .unwrap_or_else(|| DEFAULT_TITLE_FORMAT.to_string());
        let title = TitleTemplate::parse(&title_format)
            .with_context(|| format!("title format syntax error: {title_format:?}"))?;
        title
            .check()
            .with_context(|| format!("title format syntax error: {title_format:?}"))?;

        let reconnect_enabled = cli.enable_reconnect || file.enable_reconnect.unwrap_or(false);
        let reconnect_time = cli
            .reconnect_time
            .or(file.reconnect_time)
            .unwrap_or(DEFAULT_RECONNECT_SECS);

        let (preferences, raw_preference_keys) = match file.preferences {
            Some(table) => parse_preferences(table)?,
            None => (TerminalPreferences::default(), RawPreferenceKeys::default()),
        };
        let unrecognized = raw_preference_keys.unrecognized();
        if !unrecognized.is_empty() {
            warn!(keys = ?unrecognized, "ignoring unrecognized terminal preferences");
        }

        if cli.command.is_empty() {
            anyhow::bail!("--command must not be empty");
        }

        let session = SessionSettings {
            title,
            reconnect: reconnect_enabled.then_some(reconnect_time),
            preferences,
            raw_preference_keys,
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            drain_timeout: Duration::from_secs(cli.drain_timeout_secs),
        };

        Ok(ServerConfig {
            listen_addr,
            static_dir: cli.static_dir,
            default_target: Target {
                namespace: cli.namespace,
                pod: cli.pod,
                container: cli.container,
            },
            backend: BackendConfig {
                kind: cli.backend,
                command: cli.command,
                term: cli.term,
                docker_bin: cli.docker_bin,
                docker_host: cli.docker_host,
                kubectl_bin: cli.kubectl_bin,
                kube_server: cli.kube_server,
                hangup_grace: Duration::from_secs(cli.hangup_grace_secs),
            },
            session: Arc::new(session),
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

fn load_file(path: &Path) -> Result<FileConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("failed to parse config file {}", path.display()))
}

/// The keys present in the table become the allow-list; their values fill
/// the preference record.
fn parse_preferences(table: toml::Table) -> Result<(TerminalPreferences, RawPreferenceKeys)> {
    let keys = RawPreferenceKeys::new(table.keys().cloned());
    let preferences: TerminalPreferences = toml::Value::Table(table)
        .try_into()
        .context("invalid [preferences] section")?;
    Ok((preferences, keys))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(args: &[&str]) -> Result<ServerConfig> {
        let mut argv = vec!["beach-pier"];
        argv.extend_from_slice(args);
        ServerConfig::try_from(Cli::try_parse_from(argv).expect("cli parses"))
    }

    fn write_config(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "beach-pier-{}-{}.toml",
            name,
            std::process::id()
        ));
        std::fs::write(&path, contents).expect("write config");
        path
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = parse(&[]).expect("config");
        assert_eq!(config.listen_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.session.title.source(), DEFAULT_TITLE_FORMAT);
        assert_eq!(config.session.reconnect, None);
        assert!(config.session.raw_preference_keys.is_empty());
        assert_eq!(config.backend.kind, BackendKind::Kubernetes);
        assert_eq!(config.backend.command, ["/bin/bash"]);
        assert_eq!(config.default_target.namespace, "default");
        assert_eq!(
            config.session.drain_timeout,
            SessionSettings::new(config.session.title.clone()).drain_timeout
        );
    }

    #[test]
    fn reconnect_uses_default_interval_when_enabled() {
        let config = parse(&["--enable-reconnect"]).expect("config");
        assert_eq!(config.session.reconnect, Some(DEFAULT_RECONNECT_SECS));
    }

    #[test]
    fn broken_title_format_is_fatal() {
        assert!(parse(&["--title-format", "TTY - {{ .Command"]).is_err());
        assert!(parse(&["--title-format", "{{ .Nope }}"]).is_err());
    }

    #[test]
    fn file_supplies_preferences_and_allow_list() {
        let path = write_config(
            "prefs",
            r#"
title_format = "{{ .Target }}"
enable_reconnect = true
reconnect_time = 3

[preferences]
font_size = 14
background_color = "black"
"#,
        );
        let config = parse(&["--config", path.to_str().unwrap()]).expect("config");
        std::fs::remove_file(&path).ok();

        assert_eq!(config.session.title.source(), "{{ .Target }}");
        assert_eq!(config.session.reconnect, Some(3));
        assert_eq!(config.session.preferences.font_size, 14);
        let sent = config
            .session
            .preferences
            .filtered(&config.session.raw_preference_keys);
        assert_eq!(
            serde_json::Value::Object(sent),
            json!({ "font-size": 14, "background-color": "black" })
        );
    }

    #[test]
    fn cli_overrides_file() {
        let path = write_config("override", "title_format = \"from file\"\nreconnect_time = 3\n");
        let config = parse(&[
            "--config",
            path.to_str().unwrap(),
            "--title-format",
            "from cli",
            "--reconnect-time",
            "7",
            "--enable-reconnect",
        ])
        .expect("config");
        std::fs::remove_file(&path).ok();

        assert_eq!(config.session.title.source(), "from cli");
        assert_eq!(config.session.reconnect, Some(7));
    }

    #[test]
    fn mistyped_preference_value_is_rejected() {
        let path = write_config("badpref", "[preferences]\nfont_size = \"large\"\n");
        let result = parse(&["--config", path.to_str().unwrap()]);
        std::fs::remove_file(&path).ok();
        assert!(result.is_err());
    }

    #[test]
    fn invalid_listen_address_is_rejected() {
        assert!(parse(&["--address", "not an address"]).is_err());
    }
}

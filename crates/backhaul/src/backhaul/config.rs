use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

use crate::backhaul::tunnel::{protocol::MAX_PAYLOAD_BYTES, transport::parse_transport};

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
        }
    }
}

/// Finds the config file to load: `--config`, then `BACKHAUL_CONFIG`, then
/// `backhaul.{toml,yaml,yml}` in the working directory. `None` means run on
/// built-in defaults.
pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<Option<ResolvedConfigPath>> {
    if let Some(p) = explicit_flag_path {
        if p.as_os_str().is_empty() {
            anyhow::bail!("config: empty config path");
        }
        return Ok(Some(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        }));
    }

    if let Some(p) = std::env::var_os("BACKHAUL_CONFIG") {
        if !p.is_empty() {
            return Ok(Some(ResolvedConfigPath {
                path: PathBuf::from(p),
                source: ConfigPathSource::Env,
            }));
        }
    }

    Ok(discover_config_path(Path::new(".")).map(|path| ResolvedConfigPath {
        path,
        source: ConfigPathSource::Cwd,
    }))
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    ["backhaul.toml", "backhaul.yaml", "backhaul.yml"]
        .into_iter()
        .map(|c| dir.join(c))
        .find(|p| fs::metadata(p).map(|m| m.is_file()).unwrap_or(false))
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {:?}", ext),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub tunnel: TunnelConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub public_addr: String,
    pub control_addr: String,
    pub transport: String,
    pub handshake_timeout: Duration,
    pub quic: QuicServerConfig,
}

#[derive(Debug, Clone, Default)]
pub struct QuicServerConfig {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    pub target_addr: String,
    pub transport: String,
    pub dial_timeout: Duration,
    pub target_dial_timeout: Duration,
    pub max_backoff: Duration,
    pub quic: QuicClientConfig,
}

#[derive(Debug, Clone, Default)]
pub struct QuicClientConfig {
    pub server_name: String,
    pub ca_file: String,
    pub insecure_skip_verify: bool,
}

/// Per-session queue and socket tuning shared by both roles.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub queue_capacity: usize,
    /// Bytes a session may hold for a slow local socket before it is closed.
    pub inbound_limit: usize,
    pub frame_queue: usize,
    pub read_buffer: usize,
    /// `None` disables the deadline.
    pub idle_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            admin_addr: String::new(),
            logging: LoggingConfig {
                level: "info".into(),
                format: "text".into(),
                output: "stderr".into(),
                add_source: false,
            },
            server: ServerConfig {
                public_addr: ":8080".into(),
                control_addr: ":9000".into(),
                transport: "tcp".into(),
                handshake_timeout: Duration::from_millis(5000),
                quic: QuicServerConfig::default(),
            },
            client: ClientConfig {
                server_addr: "localhost:9000".into(),
                target_addr: String::new(),
                transport: "tcp".into(),
                dial_timeout: Duration::from_millis(5000),
                target_dial_timeout: Duration::from_millis(5000),
                max_backoff: Duration::from_millis(10_000),
                quic: QuicClientConfig::default(),
            },
            tunnel: TunnelConfig {
                queue_capacity: 64,
                inbound_limit: 8 * 1024 * 1024,
                frame_queue: 256,
                read_buffer: 32 * 1024,
                idle_timeout: None,
                write_timeout: None,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    admin_addr: String,

    logging: Option<FileLogging>,
    server: Option<FileServer>,
    client: Option<FileClient>,
    tunnel: Option<FileTunnel>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
struct FileServer {
    public_addr: Option<String>,
    control_addr: Option<String>,
    transport: Option<String>,
    handshake_timeout_ms: Option<i64>,
    quic: Option<FileQuicServer>,
}

#[derive(Debug, Deserialize)]
struct FileQuicServer {
    cert_file: Option<String>,
    key_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileClient {
    server_addr: Option<String>,
    target_addr: Option<String>,
    transport: Option<String>,
    dial_timeout_ms: Option<i64>,
    target_dial_timeout_ms: Option<i64>,
    max_backoff_ms: Option<i64>,
    quic: Option<FileQuicClient>,
}

#[derive(Debug, Deserialize)]
struct FileQuicClient {
    server_name: Option<String>,
    ca_file: Option<String>,
    #[serde(default)]
    insecure_skip_verify: bool,
}

#[derive(Debug, Deserialize)]
struct FileTunnel {
    queue_capacity: Option<i64>,
    inbound_limit: Option<i64>,
    frame_queue: Option<i64>,
    read_buffer: Option<i64>,
    idle_timeout_ms: Option<i64>,
    write_timeout_ms: Option<i64>,
}

fn non_empty(v: &Option<String>) -> Option<String> {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn millis(v: Option<i64>, default: Duration) -> Duration {
    match v {
        Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
        _ => default,
    }
}

/// `0` (or negative) turns an optional deadline off.
fn optional_millis(v: Option<i64>) -> Option<Duration> {
    v.filter(|ms| *ms > 0).map(|ms| Duration::from_millis(ms as u64))
}

fn count(v: Option<i64>, default: usize) -> usize {
    match v {
        Some(n) if n > 0 => n as usize,
        _ => default,
    }
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut cfg = Config {
            admin_addr: fc.admin_addr.trim().to_string(),
            ..Config::default()
        };

        // --- Logging ---
        if let Some(l) = &fc.logging {
            if let Some(level) = non_empty(&l.level) {
                cfg.logging.level = level;
            }
            if let Some(fmt) = non_empty(&l.format) {
                cfg.logging.format = fmt;
            }
            if let Some(out) = non_empty(&l.output) {
                cfg.logging.output = out;
            }
            cfg.logging.add_source = l.add_source;
        }

        // --- Server ---
        if let Some(s) = &fc.server {
            let srv = &mut cfg.server;
            if let Some(v) = non_empty(&s.public_addr) {
                srv.public_addr = v;
            }
            if let Some(v) = non_empty(&s.control_addr) {
                srv.control_addr = v;
            }
            if let Some(v) = non_empty(&s.transport) {
                srv.transport = v.to_ascii_lowercase();
            }
            srv.handshake_timeout = millis(s.handshake_timeout_ms, srv.handshake_timeout);
            if let Some(q) = &s.quic {
                srv.quic.cert_file = non_empty(&q.cert_file).unwrap_or_default();
                srv.quic.key_file = non_empty(&q.key_file).unwrap_or_default();
            }
        }

        // --- Client ---
        if let Some(c) = &fc.client {
            let cl = &mut cfg.client;
            if let Some(v) = non_empty(&c.server_addr) {
                cl.server_addr = v;
            }
            if let Some(v) = non_empty(&c.target_addr) {
                cl.target_addr = v;
            }
            if let Some(v) = non_empty(&c.transport) {
                cl.transport = v.to_ascii_lowercase();
            }
            cl.dial_timeout = millis(c.dial_timeout_ms, cl.dial_timeout);
            cl.target_dial_timeout = millis(c.target_dial_timeout_ms, cl.target_dial_timeout);
            cl.max_backoff = millis(c.max_backoff_ms, cl.max_backoff);
            if let Some(q) = &c.quic {
                cl.quic.server_name = non_empty(&q.server_name).unwrap_or_default();
                cl.quic.ca_file = non_empty(&q.ca_file).unwrap_or_default();
                cl.quic.insecure_skip_verify = q.insecure_skip_verify;
            }
        }

        // --- Tunnel ---
        if let Some(t) = &fc.tunnel {
            let tn = &mut cfg.tunnel;
            tn.queue_capacity = count(t.queue_capacity, tn.queue_capacity);
            tn.inbound_limit = count(t.inbound_limit, tn.inbound_limit);
            tn.frame_queue = count(t.frame_queue, tn.frame_queue);
            tn.read_buffer = count(t.read_buffer, tn.read_buffer);
            tn.idle_timeout = optional_millis(t.idle_timeout_ms);
            tn.write_timeout = optional_millis(t.write_timeout_ms);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks invariants that must hold whatever the source of each value.
    pub fn validate(&mut self) -> anyhow::Result<()> {
        self.server.transport = parse_transport(&self.server.transport)
            .context("config: server.transport")?;
        self.client.transport = parse_transport(&self.client.transport)
            .context("config: client.transport")?;
        // One read must fit in one DATA frame.
        self.tunnel.read_buffer = self.tunnel.read_buffer.clamp(1, MAX_PAYLOAD_BYTES as usize);
        // A single full DATA frame must never overflow a session on its own.
        self.tunnel.inbound_limit = self.tunnel.inbound_limit.max(MAX_PAYLOAD_BYTES as usize);
        Ok(())
    }

    pub fn apply_server_overrides(&mut self, o: &ServerOverrides) {
        set(&mut self.server.public_addr, &o.public_addr);
        set(&mut self.server.control_addr, &o.control_addr);
        set(&mut self.server.transport, &o.transport);
        set(&mut self.server.quic.cert_file, &o.cert_file);
        set(&mut self.server.quic.key_file, &o.key_file);
        set(&mut self.admin_addr, &o.admin_addr);
    }

    pub fn apply_client_overrides(&mut self, o: &ClientOverrides) {
        set(&mut self.client.server_addr, &o.server);
        set(&mut self.client.target_addr, &o.target);
        set(&mut self.client.transport, &o.transport);
        set(&mut self.client.quic.server_name, &o.server_name);
        set(&mut self.client.quic.ca_file, &o.ca_file);
        if o.insecure_skip_verify {
            self.client.quic.insecure_skip_verify = true;
        }
        set(&mut self.admin_addr, &o.admin_addr);
    }
}

fn set(dst: &mut String, v: &Option<String>) {
    if let Some(v) = non_empty(v) {
        *dst = v;
    }
}

/// Command-line overrides for the server role. Unset flags keep the file or
/// default value.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ServerOverrides {
    /// Public TCP address to expose (e.g. ":8080").
    #[arg(long, env = "BACKHAUL_PUBLIC_ADDR")]
    pub public_addr: Option<String>,

    /// Address clients connect to for the control stream (e.g. ":9000").
    #[arg(long, env = "BACKHAUL_CONTROL_ADDR")]
    pub control_addr: Option<String>,

    /// Control-stream transport: tcp | quic.
    #[arg(long)]
    pub transport: Option<String>,

    /// PEM certificate for the quic transport (self-signed if omitted).
    #[arg(long)]
    pub cert_file: Option<String>,

    /// PEM private key for the quic transport.
    #[arg(long)]
    pub key_file: Option<String>,

    /// Admin HTTP address (health, metrics, sessions). Disabled if empty.
    #[arg(long, env = "BACKHAUL_ADMIN_ADDR")]
    pub admin_addr: Option<String>,
}

/// Command-line overrides for the client role.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ClientOverrides {
    /// Tunnel server control address.
    #[arg(short = 's', long, env = "BACKHAUL_SERVER")]
    pub server: Option<String>,

    /// Target every tunneled connection is relayed to.
    #[arg(short = 't', long, env = "BACKHAUL_TARGET")]
    pub target: Option<String>,

    /// Control-stream transport: tcp | quic.
    #[arg(long)]
    pub transport: Option<String>,

    /// TLS server name expected by the quic transport.
    #[arg(long)]
    pub server_name: Option<String>,

    /// CA certificate (PEM) trusted by the quic transport.
    #[arg(long)]
    pub ca_file: Option<String>,

    /// Skip server certificate verification (testing only).
    #[arg(long)]
    pub insecure_skip_verify: bool,

    #[arg(long, env = "BACKHAUL_ADMIN_ADDR")]
    pub admin_addr: Option<String>,
}

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

use crate::culvert::tunnel::DEFAULT_CONTROL_PORT;

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
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    // clap already maps CULVERT_CONFIG into the flag value when unset, but
    // keep the precedence visible by treating it as "env" when present.
    if let Some(p) = std::env::var_os("CULVERT_CONFIG") {
        if !p.is_empty() {
            let p = normalize_explicit_path(Path::new(&p))?;
            return Ok(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    let p = p.to_path_buf();

    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    let meta = fs::metadata(&p);
    if let Ok(m) = meta {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(&p) {
                return Ok(discovered);
            }
            return Ok(p.join("culvert.toml"));
        }
        return Ok(p);
    }

    // Non-existent path: default to .toml if no extension.
    let mut out = p;
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    let candidates = ["culvert.toml", "culvert.yaml", "culvert.yml"];
    for c in candidates {
        let p = dir.join(c);
        if let Ok(m) = fs::metadata(&p) {
            if m.is_file() {
                return Ok(p);
            }
        }
    }
    anyhow::bail!("config: no culvert.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    // Linux: system-wide default.
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/culvert/culvert.toml"));
    }

    // Other OSes: per-user config dir.
    #[cfg(not(target_os = "linux"))]
    {
        let proj = directories::ProjectDirs::from("com", "culvert", "culvert")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("culvert.toml"))
    }
}

pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) => {
            if m.is_file() {
                return Ok(false);
            }
            anyhow::bail!("config: {} exists but is not a regular file", path.display());
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    // Create once (O_EXCL equivalent).
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create_new(true);
    let mut f = opts
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
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
        _ => anyhow::bail!("config: unsupported config extension {}", ext),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address of the HTTP control API; empty disables it.
    pub api_addr: String,
    pub logging: LoggingConfig,
    pub server: Option<ServerConfig>,
    pub clients: Vec<ClientConfig>,
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
    pub bind_addr: String,
    pub bind_tunnels: Option<String>,
    pub control_port: u16,
    pub min_port: u16,
    pub max_port: u16,
    pub secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub to: String,
    pub control_port: u16,
    pub local_host: String,
    pub local_port: u16,
    pub port: u16,
    pub secret: Option<String>,
    pub dial_timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    api_addr: String,

    logging: Option<FileLogging>,

    server: Option<FileServer>,

    #[serde(default)]
    clients: Vec<FileClient>,
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
#[serde(deny_unknown_fields)]
struct FileServer {
    bind_addr: Option<String>,
    bind_tunnels: Option<String>,
    control_port: Option<u16>,
    min_port: Option<u16>,
    max_port: Option<u16>,
    secret: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClient {
    to: String,
    control_port: Option<u16>,
    local_host: Option<String>,
    local_port: u16,
    port: Option<u16>,
    secret: Option<String>,
    dial_timeout_ms: Option<i64>,
}

fn optional_trimmed(s: Option<&String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut cfg = Config {
            api_addr: fc.api_addr.trim().to_string(),
            logging: LoggingConfig {
                level: "info".into(),
                format: "json".into(),
                output: "stderr".into(),
                add_source: false,
            },
            server: None,
            clients: vec![],
        };

        if let Some(l) = &fc.logging {
            if let Some(level) = optional_trimmed(l.level.as_ref()) {
                cfg.logging.level = level;
            }
            if let Some(format) = optional_trimmed(l.format.as_ref()) {
                cfg.logging.format = format;
            }
            if let Some(output) = optional_trimmed(l.output.as_ref()) {
                cfg.logging.output = output;
            }
            cfg.logging.add_source = l.add_source;
        }

        if let Some(s) = &fc.server {
            cfg.server = Some(ServerConfig {
                bind_addr: s
                    .bind_addr
                    .as_deref()
                    .unwrap_or("0.0.0.0")
                    .trim()
                    .to_string(),
                bind_tunnels: optional_trimmed(s.bind_tunnels.as_ref()),
                control_port: s.control_port.unwrap_or(DEFAULT_CONTROL_PORT),
                min_port: s.min_port.unwrap_or(10000),
                max_port: s.max_port.unwrap_or(60000),
                secret: optional_trimmed(s.secret.as_ref()),
            });
        }

        for (i, c) in fc.clients.iter().enumerate() {
            let to = c.to.trim().to_string();
            if to.is_empty() {
                anyhow::bail!("config: clients[{i}] missing to");
            }
            if c.local_port == 0 {
                anyhow::bail!("config: clients[{i}] local_port must be at least 1");
            }
            cfg.clients.push(ClientConfig {
                to,
                control_port: c.control_port.unwrap_or(DEFAULT_CONTROL_PORT),
                local_host: c
                    .local_host
                    .as_deref()
                    .unwrap_or("localhost")
                    .trim()
                    .to_string(),
                local_port: c.local_port,
                port: c.port.unwrap_or(0),
                secret: optional_trimmed(c.secret.as_ref()),
                dial_timeout: Duration::from_millis(c.dial_timeout_ms.unwrap_or(5000).max(0) as u64),
            });
        }

        Ok(cfg)
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# Culvert configuration (auto-generated)
#
# This file was created because Culvert could not find a configuration file at
# the resolved config path.
#
# This default config starts a tunnel server plus the HTTP control API. Tunnel
# clients connect to the control port, authenticate, and are assigned a public
# port from [min_port, max_port]. Tunnels can also be started and stopped at
# runtime through the API.

api_addr = ":8080"

[server]
bind_addr = "0.0.0.0"
control_port = 7835
min_port = 10000
max_port = 60000
secret = ""

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false

# To forward a local service through a remote Culvert server, declare clients:
#
# [[clients]]
# to = "tunnel.example.com"
# control_port = 7835
# local_host = "localhost"
# local_port = 8080
# port = 0          # 0 = let the server pick a public port
# secret = ""
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# Culvert configuration (auto-generated)
#
# This file was created because Culvert could not find a configuration file at
# the resolved config path.
#
# This default config starts a tunnel server plus the HTTP control API. Tunnel
# clients connect to the control port, authenticate, and are assigned a public
# port from [min_port, max_port]. Tunnels can also be started and stopped at
# runtime through the API.

api_addr: ":8080"

server:
  bind_addr: "0.0.0.0"
  control_port: 7835
  min_port: 10000
  max_port: 60000
  secret: ""

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false

# To forward a local service through a remote Culvert server, declare clients:
#
# clients:
#   - to: "tunnel.example.com"
#     control_port: 7835
#     local_host: "localhost"
#     local_port: 8080
#     port: 0          # 0 = let the server pick a public port
#     secret: ""
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!(
            "culvert_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    #[test]
    fn empty_server_section_gets_defaults() {
        let dir = temp_dir("server_defaults");
        let cfg_path = dir.join("culvert.toml");

        std::fs::write(&cfg_path, "[server]\n").expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");

        let server = cfg.server.expect("server section");
        assert_eq!(server.bind_addr, "0.0.0.0");
        assert_eq!(server.control_port, DEFAULT_CONTROL_PORT);
        assert_eq!(server.min_port, 10000);
        assert_eq!(server.max_port, 60000);
        assert!(server.secret.is_none());
        assert!(cfg.clients.is_empty());
        assert_eq!(cfg.api_addr, "");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn client_requires_to_and_local_port() {
        let dir = temp_dir("client_required");
        let cfg_path = dir.join("culvert.toml");

        let toml = r#"
[[clients]]
local_port = 8080
"#;
        std::fs::write(&cfg_path, toml).expect("write");
        let err = load_config(&cfg_path).unwrap_err();
        assert!(format!("{err:#}").contains("to"));

        let toml = r#"
[[clients]]
to = "tunnel.example.com"
local_port = 0
"#;
        std::fs::write(&cfg_path, toml).expect("write");
        let err = load_config(&cfg_path).unwrap_err();
        assert!(format!("{err:#}").contains("local_port"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn blank_secret_is_dropped() {
        let dir = temp_dir("blank_secret");
        let cfg_path = dir.join("culvert.toml");

        let toml = r#"
[server]
secret = "   "

[[clients]]
to = "tunnel.example.com"
local_port = 8080
secret = "hunter2"
"#;
        std::fs::write(&cfg_path, toml).expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");
        assert!(cfg.server.unwrap().secret.is_none());
        assert_eq!(cfg.clients[0].secret.as_deref(), Some("hunter2"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn yaml_config_loads() {
        let dir = temp_dir("yaml");
        let cfg_path = dir.join("culvert.yaml");

        let yaml = r#"
api_addr: ":8080"
clients:
  - to: "tunnel.example.com"
    local_port: 3000
    port: 41000
"#;
        std::fs::write(&cfg_path, yaml).expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");
        assert_eq!(cfg.api_addr, ":8080");
        assert_eq!(cfg.clients.len(), 1);
        assert_eq!(cfg.clients[0].local_host, "localhost");
        assert_eq!(cfg.clients[0].port, 41000);
        assert_eq!(cfg.clients[0].dial_timeout, Duration::from_millis(5000));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let dir = temp_dir("unknown");
        let cfg_path = dir.join("culvert.toml");

        let toml = r#"
listen_addr = ":7000"
"#;
        std::fs::write(&cfg_path, toml).expect("write");
        let err = load_config(&cfg_path).unwrap_err();
        let msg = format!("{err:#}").to_ascii_lowercase();
        assert!(
            msg.contains("listen_addr"),
            "expected error mentioning listen_addr, got: {msg}"
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn template_is_written_once() {
        let dir = temp_dir("template");
        let cfg_path = dir.join("nested").join("culvert.toml");

        assert!(ensure_config_file(&cfg_path).expect("ensure"));
        assert!(!ensure_config_file(&cfg_path).expect("ensure again"));

        let cfg = load_config(&cfg_path).expect("template must load");
        assert_eq!(cfg.api_addr, ":8080");
        let server = cfg.server.expect("template declares a server");
        assert_eq!(server.min_port, 10000);

        let _ = std::fs::remove_dir_all(&dir);
    }
}

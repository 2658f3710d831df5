//! Configuration types.
//!
//! Everything comes from `AGENT_DISPATCH_*` environment variables with
//! typed defaults. Unset or blank means default; malformed values are errors.

use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

use crate::admission::{AdmissionConfig, Ceilings};
use crate::error::ConfigError;
use crate::worker::{CommandSpec, WorkerConfig};

const ENV_PREFIX: &str = "AGENT_DISPATCH_";

/// Which loops this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roles {
    pub api: bool,
    pub worker: bool,
    pub admission: bool,
}

impl Roles {
    pub const ALL: Roles = Roles {
        api: true,
        worker: true,
        admission: true,
    };
}

impl FromStr for Roles {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut roles = Roles {
            api: false,
            worker: false,
            admission: false,
        };
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.to_ascii_lowercase().as_str() {
                "all" => roles = Roles::ALL,
                "api" => roles.api = true,
                "worker" => roles.worker = true,
                "admission" => roles.admission = true,
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: format!("{ENV_PREFIX}ROLE"),
                        message: format!("unknown role '{other}'"),
                    });
                }
            }
        }
        if roles == (Roles { api: false, worker: false, admission: false }) {
            return Err(ConfigError::InvalidValue {
                key: format!("{ENV_PREFIX}ROLE"),
                message: "no role selected".into(),
            });
        }
        Ok(roles)
    }
}

/// Process configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub db_path: PathBuf,
    pub port: u16,
    pub roles: Roles,
    pub agents_file: PathBuf,
    pub command: CommandSpec,
    pub timeout: Duration,
    pub prompt_max_chars: usize,
    pub worker_interval: Duration,
    pub admission_interval: Duration,
    pub max_concurrent: usize,
    pub ceilings: Ceilings,
    pub exclusions: HashSet<Uuid>,
    pub stale_after: Duration,
    pub blocked_webhook: Option<String>,
    pub worker_id: String,
    pub log_dir: Option<PathBuf>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/agent-dispatch.db"),
            port: 3460,
            roles: Roles::ALL,
            agents_file: PathBuf::from("./agents.json"),
            command: CommandSpec::new("claude", vec!["-p".into()]),
            timeout: Duration::from_secs(300),
            prompt_max_chars: 4000,
            worker_interval: Duration::from_secs(30),
            admission_interval: Duration::from_secs(10),
            max_concurrent: 3,
            ceilings: Ceilings::default(),
            exclusions: HashSet::new(),
            stale_after: Duration::from_secs(3600),
            blocked_webhook: None,
            worker_id: default_worker_id(),
            log_dir: None,
        }
    }
}

impl DispatchConfig {
    /// Read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup. Unset or blank means default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let command = match get("COMMAND") {
            Some(line) => CommandSpec::parse(&line).ok_or_else(|| invalid("COMMAND", "empty command"))?,
            None => defaults.command,
        };

        let ceilings = Ceilings {
            cpu: percent(&get, "CPU_CEILING", defaults.ceilings.cpu)?,
            ram: percent(&get, "RAM_CEILING", defaults.ceilings.ram)?,
            disk: percent(&get, "DISK_CEILING", defaults.ceilings.disk)?,
        };

        let exclusions = match get("EXCLUDE") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    Uuid::parse_str(s)
                        .map_err(|e| invalid("EXCLUDE", &format!("'{s}' is not a task id: {e}")))
                })
                .collect::<Result<HashSet<_>, _>>()?,
            None => HashSet::new(),
        };

        let timeout = seconds(&get, "TIMEOUT_SECS", defaults.timeout)?;
        let stale_after = seconds(&get, "STALE_AFTER_SECS", defaults.stale_after)?;
        if stale_after <= timeout {
            return Err(invalid(
                "STALE_AFTER_SECS",
                &format!(
                    "must exceed {ENV_PREFIX}TIMEOUT_SECS ({}s)",
                    timeout.as_secs()
                ),
            ));
        }

        Ok(Self {
            db_path: get("DB_PATH").map(PathBuf::from).unwrap_or(defaults.db_path),
            port: parsed(&get, "PORT", defaults.port)?,
            roles: match get("ROLE") {
                Some(s) => s.parse()?,
                None => defaults.roles,
            },
            agents_file: get("AGENTS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.agents_file),
            command,
            timeout,
            prompt_max_chars: positive(&get, "PROMPT_MAX_CHARS", defaults.prompt_max_chars)?,
            worker_interval: seconds(&get, "WORKER_INTERVAL_SECS", defaults.worker_interval)?,
            admission_interval: seconds(&get, "ADMISSION_INTERVAL_SECS", defaults.admission_interval)?,
            max_concurrent: positive(&get, "MAX_CONCURRENT", defaults.max_concurrent)?,
            ceilings,
            exclusions,
            stale_after,
            blocked_webhook: get("BLOCKED_WEBHOOK"),
            worker_id: get("WORKER_ID").unwrap_or(defaults.worker_id),
            log_dir: get("LOG_DIR").map(PathBuf::from),
        })
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            worker_id: self.worker_id.clone(),
            default_command: self.command.clone(),
            default_timeout: self.timeout,
            prompt_max_chars: self.prompt_max_chars,
            stale_after: self.stale_after,
        }
    }

    pub fn admission_config(&self) -> AdmissionConfig {
        AdmissionConfig {
            ceilings: self.ceilings,
            max_concurrent: self.max_concurrent,
            exclusions: self.exclusions.clone(),
        }
    }
}

fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "host".to_string());
    format!("{}-{}", host.trim(), std::process::id())
}

fn invalid(name: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: format!("{ENV_PREFIX}{name}"),
        message: message.to_string(),
    }
}

fn parsed<T, G>(get: &G, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => raw
            .parse()
            .map_err(|e| invalid(name, &format!("'{raw}': {e}"))),
        None => Ok(default),
    }
}

fn positive<G>(get: &G, name: &str, default: usize) -> Result<usize, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match parsed(get, name, default)? {
        0 => Err(invalid(name, "must be greater than zero")),
        n => Ok(n),
    }
}

fn seconds<G>(get: &G, name: &str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match parsed(get, name, default.as_secs())? {
        0 => Err(invalid(name, "must be at least one second")),
        secs => Ok(Duration::from_secs(secs)),
    }
}

fn percent<G>(get: &G, name: &str, default: f64) -> Result<f64, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let value: f64 = parsed(get, name, default)?;
    if value > 0.0 && value <= 100.0 {
        Ok(value)
    } else {
        Err(invalid(name, "must be within (0, 100]"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<DispatchConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (format!("{ENV_PREFIX}{k}"), v.to_string()))
            .collect();
        DispatchConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.port, 3460);
        assert_eq!(config.roles, Roles::ALL);
        assert_eq!(config.command.to_string(), "claude -p");
        assert_eq!(config.timeout, Duration::from_secs(300));
        assert_eq!(config.prompt_max_chars, 4000);
        assert_eq!(config.worker_interval, Duration::from_secs(30));
        assert_eq!(config.admission_interval, Duration::from_secs(10));
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.ceilings, Ceilings::default());
        assert!(config.exclusions.is_empty());
        assert!(config.blocked_webhook.is_none());
        assert!(config.worker_id.ends_with(&std::process::id().to_string()));
    }

    #[test]
    fn overrides_are_parsed() {
        let id = Uuid::new_v4();
        let config = from_pairs(&[
            ("PORT", "9000"),
            ("ROLE", "api, worker"),
            ("COMMAND", "ollama run llama3"),
            ("CPU_CEILING", "70.5"),
            ("MAX_CONCURRENT", "8"),
            ("EXCLUDE", &format!("{id}, ")),
            ("WORKER_ID", "box-1"),
            ("BLOCKED_WEBHOOK", "http://localhost:9999/hook"),
        ])
        .unwrap();
        assert_eq!(config.port, 9000);
        assert!(config.roles.api && config.roles.worker && !config.roles.admission);
        assert_eq!(config.command.program, "ollama");
        assert_eq!(config.command.args, vec!["run", "llama3"]);
        assert_eq!(config.ceilings.cpu, 70.5);
        assert_eq!(config.ceilings.ram, 85.0);
        assert_eq!(config.max_concurrent, 8);
        assert!(config.exclusions.contains(&id));
        assert_eq!(config.worker_config().worker_id, "box-1");
        assert_eq!(config.admission_config().max_concurrent, 8);
        assert!(config.blocked_webhook.is_some());
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert!(from_pairs(&[("PORT", "eighty")]).is_err());
        assert!(from_pairs(&[("CPU_CEILING", "120")]).is_err());
        assert!(from_pairs(&[("MAX_CONCURRENT", "0")]).is_err());
        assert!(from_pairs(&[("TIMEOUT_SECS", "0")]).is_err());
        assert!(from_pairs(&[("EXCLUDE", "not-a-uuid")]).is_err());
        assert!(from_pairs(&[("ROLE", "janitor")]).is_err());
    }

    #[test]
    fn stale_window_must_outlast_timeout() {
        let err = from_pairs(&[("STALE_AFTER_SECS", "60"), ("TIMEOUT_SECS", "600")]).unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "AGENT_DISPATCH_STALE_AFTER_SECS")
        );
        assert!(from_pairs(&[("STALE_AFTER_SECS", "300")]).is_err());

        let config = from_pairs(&[("STALE_AFTER_SECS", "900"), ("TIMEOUT_SECS", "600")]).unwrap();
        assert_eq!(config.stale_after, Duration::from_secs(900));
    }

    #[test]
    fn blank_values_mean_default() {
        let config = from_pairs(&[("PORT", "  "), ("COMMAND", "")]).unwrap();
        assert_eq!(config.port, 3460);
        assert_eq!(config.command.program, "claude");
    }

    #[test]
    fn role_parsing() {
        assert_eq!("all".parse::<Roles>().unwrap(), Roles::ALL);
        let roles: Roles = "admission".parse().unwrap();
        assert!(roles.admission && !roles.api && !roles.worker);
        assert!(" , ".parse::<Roles>().is_err());
    }
}

//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > defaults. The credential
//! encryption key is never stored in the TOML — it comes from the
//! `CREDENTIAL_KEK_BASE64` env var (see `credential-store`), so a
//! leaked config file exposes no secrets.
//!
//! The `[operations]` table holds the default per-operation candidate
//! lists; at runtime an operator can edit them through the admin API
//! (new lists apply to new requests only).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use provider::CandidateDescriptor;
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub user_quota: UserQuotaSettings,
    pub candidates: Vec<CandidateConfig>,
    /// Default per-operation candidate lists, e.g.
    /// `compress = ["cloud-doc-api", "local-library"]`
    pub operations: HashMap<String, Vec<String>>,
}

/// Service listeners and state location
#[derive(Debug, Deserialize)]
pub struct OrchestratorConfig {
    /// Conversion + health + metrics listener
    pub listen_addr: SocketAddr,
    /// Admin API listener (separate port, not publicly exposed)
    pub admin_addr: SocketAddr,
    /// Directory for the pool and user-quota state files
    pub state_dir: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Credential pool tunables
#[derive(Debug, Deserialize)]
pub struct PoolSettings {
    /// Minimum monthly remaining units for normal selection
    #[serde(default = "default_safety_threshold")]
    pub safety_threshold: u64,
    /// Monthly headroom fraction that triggers preemptive rotation
    #[serde(default = "default_preemptive_fraction")]
    pub preemptive_fraction: f64,
    /// Relaxed-selection horizon before a quota reset
    #[serde(default = "default_reset_horizon_secs")]
    pub reset_horizon_secs: u64,
    /// Quota reset sweep interval
    #[serde(default = "default_reset_interval_secs")]
    pub reset_interval_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            safety_threshold: default_safety_threshold(),
            preemptive_fraction: default_preemptive_fraction(),
            reset_horizon_secs: default_reset_horizon_secs(),
            reset_interval_secs: default_reset_interval_secs(),
        }
    }
}

/// User premium-quota tunables
#[derive(Debug, Deserialize)]
pub struct UserQuotaSettings {
    /// Monthly premium operations for owners without a subscription
    #[serde(default = "default_legacy_limit")]
    pub default_legacy_limit: u64,
}

impl Default for UserQuotaSettings {
    fn default() -> Self {
        Self {
            default_legacy_limit: default_legacy_limit(),
        }
    }
}

/// One fallback candidate: static descriptor plus adapter wiring.
#[derive(Debug, Clone, Deserialize)]
pub struct CandidateConfig {
    pub name: String,
    /// Credential pool provider; absent for local candidates
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub premium: bool,
    #[serde(default = "default_quality")]
    pub quality: String,
    /// "cloud-api", "llm-vision", or "local"
    pub kind: String,
    #[serde(default = "default_candidate_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub cost_per_1k: f64,
    /// Endpoint for remote kinds
    #[serde(default)]
    pub base_url: Option<String>,
    /// Model identifier for llm-vision kinds
    #[serde(default)]
    pub model: Option<String>,
    /// OCR locales an llm-vision candidate accepts; empty = all
    #[serde(default)]
    pub languages: Vec<String>,
    /// argv template for local kinds, with {input}/{output} placeholders
    #[serde(default)]
    pub command: Vec<String>,
}

impl CandidateConfig {
    /// Static metadata surfaced to callers with every result.
    pub fn descriptor(&self) -> CandidateDescriptor {
        CandidateDescriptor {
            name: self.name.clone(),
            provider: self.provider.clone(),
            premium: self.premium,
            quality: self.quality.clone(),
            kind: self.kind.clone(),
            timeout_secs: self.timeout_secs,
            cost_per_1k: self.cost_per_1k,
        }
    }
}

fn default_max_connections() -> usize {
    1000
}

fn default_safety_threshold() -> u64 {
    10_000
}

fn default_preemptive_fraction() -> f64 {
    0.05
}

fn default_reset_horizon_secs() -> u64 {
    3600
}

fn default_reset_interval_secs() -> u64 {
    300
}

fn default_legacy_limit() -> u64 {
    20
}

fn default_quality() -> String {
    "standard".to_string()
}

fn default_candidate_timeout() -> u64 {
    60
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-field validation: candidate wiring must match its kind and
    /// every routed name must be declared.
    fn validate(&self) -> common::Result<()> {
        if self.candidates.is_empty() {
            return Err(common::Error::Config(
                "at least one [[candidates]] entry is required".into(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for candidate in &self.candidates {
            if !names.insert(candidate.name.as_str()) {
                return Err(common::Error::Config(format!(
                    "duplicate candidate name: {}",
                    candidate.name
                )));
            }

            if candidate.premium && candidate.provider.is_none() {
                return Err(common::Error::Config(format!(
                    "candidate {} is premium but names no provider",
                    candidate.name
                )));
            }

            match candidate.kind.as_str() {
                "local" => {
                    if candidate.command.is_empty() {
                        return Err(common::Error::Config(format!(
                            "local candidate {} needs a command",
                            candidate.name
                        )));
                    }
                    let has_input = candidate.command.iter().any(|a| a.contains("{input}"));
                    let has_output = candidate.command.iter().any(|a| a.contains("{output}"));
                    if !has_input || !has_output {
                        return Err(common::Error::Config(format!(
                            "local candidate {} command must use {{input}} and {{output}} placeholders",
                            candidate.name
                        )));
                    }
                }
                "cloud-api" | "llm-vision" => {
                    if candidate.base_url.is_none() {
                        return Err(common::Error::Config(format!(
                            "candidate {} ({}) needs a base_url",
                            candidate.name, candidate.kind
                        )));
                    }
                }
                other => {
                    return Err(common::Error::Config(format!(
                        "candidate {} has unknown kind: {other}",
                        candidate.name
                    )));
                }
            }

            if candidate.timeout_secs == 0 {
                return Err(common::Error::Config(format!(
                    "candidate {} timeout_secs must be greater than 0",
                    candidate.name
                )));
            }
        }

        if self.operations.is_empty() {
            return Err(common::Error::Config(
                "at least one [operations] entry is required".into(),
            ));
        }
        for (operation, list) in &self.operations {
            if list.is_empty() {
                return Err(common::Error::Config(format!(
                    "operation {operation} has an empty candidate list"
                )));
            }
            for name in list {
                if !names.contains(name.as_str()) {
                    return Err(common::Error::Config(format!(
                        "operation {operation} routes to undeclared candidate: {name}"
                    )));
                }
            }
        }

        if self.orchestrator.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("convert-orchestrator.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn valid_toml() -> &'static str {
        r#"
[orchestrator]
listen_addr = "127.0.0.1:8080"
admin_addr = "127.0.0.1:9090"
state_dir = "/var/lib/convert-orchestrator"

[[candidates]]
name = "cloud-doc-api"
provider = "clouddoc"
premium = true
quality = "high"
kind = "cloud-api"
timeout_secs = 120
cost_per_1k = 0.4
base_url = "https://api.clouddoc.example"

[[candidates]]
name = "local-library"
kind = "local"
timeout_secs = 30
command = ["qpdf", "--linearize", "{input}", "{output}"]

[operations]
compress = ["cloud-doc-api", "local-library"]
"pdf-to-word" = ["cloud-doc-api", "local-library"]
"#
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());

        let config = Config::load(&path).unwrap();
        assert_eq!(config.orchestrator.max_connections, 1000);
        assert_eq!(config.pool.safety_threshold, 10_000);
        assert_eq!(config.pool.preemptive_fraction, 0.05);
        assert_eq!(config.user_quota.default_legacy_limit, 20);
        assert_eq!(config.candidates.len(), 2);
        assert_eq!(config.operations["compress"].len(), 2);

        let desc = config.candidates[0].descriptor();
        assert_eq!(desc.name, "cloud-doc-api");
        assert!(desc.premium);
        assert_eq!(desc.provider.as_deref(), Some("clouddoc"));
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "not valid {{{{ toml");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_premium_candidate_without_provider_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[orchestrator]
listen_addr = "127.0.0.1:8080"
admin_addr = "127.0.0.1:9090"
state_dir = "/tmp"

[[candidates]]
name = "bad"
premium = true
kind = "cloud-api"
base_url = "https://api.example"

[operations]
compress = ["bad"]
"#,
        );
        let err = Config::load(&path).unwrap_err();
        assert!(
            err.to_string().contains("premium but names no provider"),
            "got: {err}"
        );
    }

    #[test]
    fn test_local_candidate_without_command_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[orchestrator]
listen_addr = "127.0.0.1:8080"
admin_addr = "127.0.0.1:9090"
state_dir = "/tmp"

[[candidates]]
name = "local"
kind = "local"

[operations]
compress = ["local"]
"#,
        );
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("needs a command"), "got: {err}");
    }

    #[test]
    fn test_local_command_requires_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[orchestrator]
listen_addr = "127.0.0.1:8080"
admin_addr = "127.0.0.1:9090"
state_dir = "/tmp"

[[candidates]]
name = "local"
kind = "local"
command = ["convert-tool", "--fast"]

[operations]
compress = ["local"]
"#,
        );
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("placeholders"), "got: {err}");
    }

    #[test]
    fn test_operation_routing_to_undeclared_candidate_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[orchestrator]
listen_addr = "127.0.0.1:8080"
admin_addr = "127.0.0.1:9090"
state_dir = "/tmp"

[[candidates]]
name = "local"
kind = "local"
command = ["cp", "{input}", "{output}"]

[operations]
compress = ["local", "ghost"]
"#,
        );
        let err = Config::load(&path).unwrap_err();
        assert!(
            err.to_string().contains("undeclared candidate: ghost"),
            "got: {err}"
        );
    }

    #[test]
    fn test_remote_candidate_without_base_url_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[orchestrator]
listen_addr = "127.0.0.1:8080"
admin_addr = "127.0.0.1:9090"
state_dir = "/tmp"

[[candidates]]
name = "vision"
provider = "visionocr"
kind = "llm-vision"

[operations]
ocr = ["vision"]
"#,
        );
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("needs a base_url"), "got: {err}");
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[orchestrator]
listen_addr = "127.0.0.1:8080"
admin_addr = "127.0.0.1:9090"
state_dir = "/tmp"

[[candidates]]
name = "weird"
kind = "quantum"

[operations]
compress = ["weird"]
"#,
        );
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("unknown kind"), "got: {err}");
    }

    #[test]
    fn test_duplicate_candidate_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[orchestrator]
listen_addr = "127.0.0.1:8080"
admin_addr = "127.0.0.1:9090"
state_dir = "/tmp"

[[candidates]]
name = "local"
kind = "local"
command = ["cp", "{input}", "{output}"]

[[candidates]]
name = "local"
kind = "local"
command = ["cp", "{input}", "{output}"]

[operations]
compress = ["local"]
"#,
        );
        let err = Config::load(&path).unwrap_err();
        assert!(
            err.to_string().contains("duplicate candidate"),
            "got: {err}"
        );
    }

    #[test]
    fn test_empty_operation_list_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[orchestrator]
listen_addr = "127.0.0.1:8080"
admin_addr = "127.0.0.1:9090"
state_dir = "/tmp"

[[candidates]]
name = "local"
kind = "local"
command = ["cp", "{input}", "{output}"]

[operations]
compress = []
"#,
        );
        let err = Config::load(&path).unwrap_err();
        assert!(
            err.to_string().contains("empty candidate list"),
            "got: {err}"
        );
    }

    #[test]
    fn test_resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn test_resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("/env/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn test_resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("convert-orchestrator.toml"));
    }

    #[test]
    fn test_resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/should-lose.toml") };
        let path = Config::resolve_path(Some("/cli/wins.toml"));
        assert_eq!(
            path,
            PathBuf::from("/cli/wins.toml"),
            "CLI arg must take precedence over CONFIG_PATH env var"
        );
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn test_pool_settings_overridable() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[orchestrator]
listen_addr = "127.0.0.1:8080"
admin_addr = "127.0.0.1:9090"
state_dir = "/tmp"

[pool]
safety_threshold = 500
preemptive_fraction = 0.1

[[candidates]]
name = "local"
kind = "local"
command = ["cp", "{input}", "{output}"]

[operations]
compress = ["local"]
"#,
        );
        let config = Config::load(&path).unwrap();
        assert_eq!(config.pool.safety_threshold, 500);
        assert_eq!(config.pool.preemptive_fraction, 0.1);
        // Unset fields keep their defaults
        assert_eq!(config.pool.reset_horizon_secs, 3600);
    }
}

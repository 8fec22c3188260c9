use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SdkError};

/// How the artifact cache chooses entries to drop when over budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Least recently read or written entry goes first.
    #[default]
    Lru,
    /// Oldest inserted entry goes first; reads never reorder.
    InsertionOrder,
}

/// Process-wide session settings, fixed once sessions are created.
///
/// Shared as `Arc<SessionParameters>` by every session and the controller.
#[derive(Debug, Clone)]
pub struct SessionParameters {
    pub num_threads: usize,
    pub execution_providers: Vec<String>,
    pub memory_limit_mb: u64,
    pub cache_budget_bytes: u64,
    pub cache_name: String,
    pub cache_dir: PathBuf,
    pub asset_root: Option<String>,
    pub eviction: EvictionPolicy,
}

impl Default for SessionParameters {
    fn default() -> Self {
        Self {
            num_threads: 1,
            execution_providers: vec!["cpu".to_string()],
            memory_limit_mb: 4096,
            cache_budget_bytes: 2 * 1024 * 1024 * 1024,
            cache_name: "edge-inference-models".to_string(),
            cache_dir: PathBuf::from(".cache"),
            asset_root: None,
            eviction: EvictionPolicy::Lru,
        }
    }
}

impl SessionParameters {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let num_threads = parse_var("SDK_NUM_THREADS")?.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(defaults.num_threads)
        });
        let execution_providers = env::var("SDK_EXECUTION_PROVIDERS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(|p| p.trim().to_lowercase())
                    .filter(|p| !p.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|providers| !providers.is_empty())
            .unwrap_or(defaults.execution_providers);
        let memory_limit_mb = parse_var("SDK_MEMORY_LIMIT_MB")?.unwrap_or(defaults.memory_limit_mb);
        let cache_budget_bytes = parse_var::<u64>("SDK_CACHE_BUDGET_MB")?
            .map(|mb| budget_bytes("SDK_CACHE_BUDGET_MB", mb))
            .transpose()?
            .unwrap_or(defaults.cache_budget_bytes);
        let cache_name = env::var("SDK_CACHE_NAME").unwrap_or(defaults.cache_name);
        let cache_dir = env::var("SDK_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_dir);
        let asset_root = env::var("SDK_ASSET_ROOT").ok();
        let eviction = match env::var("SDK_CACHE_EVICTION").as_deref() {
            Ok("insertion") | Ok("insertion_order") => EvictionPolicy::InsertionOrder,
            Ok("lru") | Err(_) => EvictionPolicy::Lru,
            Ok(other) => {
                return Err(SdkError::Config(format!(
                    "SDK_CACHE_EVICTION must be `lru` or `insertion`, got `{other}`"
                )));
            }
        };

        Ok(Self {
            num_threads,
            execution_providers,
            memory_limit_mb,
            cache_budget_bytes,
            cache_name,
            cache_dir,
            asset_root,
            eviction,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub catalog_path: PathBuf,
    pub preload_models: Vec<String>,
    pub proxy_sessions: bool,
    pub max_new_tokens: usize,
    pub session: SessionParameters,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let listen_addr = env::var("SERVER_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".into())
            .parse()
            .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080));

        let catalog_path = PathBuf::from(
            env::var("MODEL_CATALOG_PATH").unwrap_or_else(|_| "models/catalog.json".to_string()),
        );
        let preload_models = env::var("PRELOAD_MODELS")
            .map(|raw| {
                raw.split(',')
                    .map(|id| id.trim().to_string())
                    .filter(|id| !id.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let proxy_sessions = env::var("SESSION_PROXY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(true);
        let max_new_tokens = env::var("MAX_NEW_TOKENS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(64);

        Ok(Self {
            listen_addr,
            catalog_path,
            preload_models,
            proxy_sessions,
            max_new_tokens,
            session: SessionParameters::from_env()?,
        })
    }
}

fn budget_bytes(name: &str, mb: u64) -> Result<u64> {
    mb.checked_mul(1024 * 1024)
        .ok_or_else(|| SdkError::Config(format!("{name} of {mb} MB does not fit in 64 bits")))
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| SdkError::Config(format!("{name} has an invalid value `{raw}`"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_budget_is_converted_from_megabytes() {
        assert_eq!(budget_bytes("SDK_CACHE_BUDGET_MB", 3).unwrap(), 3 * 1024 * 1024);
        assert!(matches!(
            budget_bytes("SDK_CACHE_BUDGET_MB", u64::MAX / 1024),
            Err(SdkError::Config(_))
        ));
    }
}

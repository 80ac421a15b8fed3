//! Configuration
//!
//! A single `config.yaml` in the Mnesis config directory, deep-merged onto
//! typed defaults at load time. The merged config is cached process-wide and
//! re-read only on `force_reload` (settings UIs edit the file externally).

use std::path::PathBuf;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// Environment variable overriding the config/data directory.
pub const DATA_DIR_ENV: &str = "MNESIS_DATA_DIR";

/// Resolve the Mnesis config directory.
///
/// Order: `MNESIS_DATA_DIR` env override, `%APPDATA%\Mnesis` on Windows,
/// `~/.mnesis` elsewhere.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }

    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("Mnesis");
        }
    }

    if let Some(base) = directories::BaseDirs::new() {
        return base.home_dir().join(".mnesis");
    }
    PathBuf::from(".mnesis")
}

/// Resolve the data directory (`<config_dir>/data`), creating it with
/// owner-only permissions on POSIX.
pub fn data_dir() -> PathBuf {
    let dir = config_dir().join("data");
    if std::fs::create_dir_all(&dir).is_ok() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(config_dir(), std::fs::Permissions::from_mode(0o700));
            let _ = std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700));
        }
    }
    dir
}

// ============================================================================
// CONFIG SECTIONS
// ============================================================================

/// Per-level Ebbinghaus decay rates (`k` in `retention = exp(-k * days)`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecayRates {
    pub semantic: f64,
    pub episodic: f64,
    pub working: f64,
}

impl Default for DecayRates {
    fn default() -> Self {
        Self {
            semantic: 0.001,
            episodic: 0.05,
            working: 0.3,
        }
    }
}

impl DecayRates {
    /// Decay constant for a level string, defaulting to the semantic rate.
    pub fn for_level(&self, level: &str) -> f64 {
        match level {
            "episodic" => self.episodic,
            "working" => self.working,
            _ => self.semantic,
        }
    }
}

/// Conversation-analysis (miner) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationAnalysisConfig {
    /// Provider id: `openai` | `anthropic` | `ollama` | `heuristic` | `auto`.
    pub provider: String,
    pub model: String,
    pub api_base_url: String,
    pub api_key: String,
    /// When true, analysis is blocked unless an LLM runtime is configured
    /// and reachable. When false, heuristic extraction is an accepted mode.
    pub require_llm_configured: bool,
    /// Hourly scheduler check enqueues a mining job when enabled and the
    /// interval has elapsed.
    pub auto_enabled: bool,
    pub auto_interval_hours: u64,
    pub promotion_min_score: f64,
    pub promotion_min_evidence: u32,
    pub promotion_min_conversations: u32,
    pub semantic_dedupe_threshold: f64,
}

impl Default for ConversationAnalysisConfig {
    fn default() -> Self {
        Self {
            provider: "auto".to_string(),
            model: String::new(),
            api_base_url: String::new(),
            api_key: String::new(),
            require_llm_configured: true,
            auto_enabled: false,
            auto_interval_hours: 24,
            promotion_min_score: 0.72,
            promotion_min_evidence: 1,
            promotion_min_conversations: 1,
            semantic_dedupe_threshold: 0.92,
        }
    }
}

/// Root configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub decay_rates: DecayRates,
    pub conversation_analysis: ConversationAnalysisConfig,
    /// Bearer token accepted by the read-only snapshot surface. Rotated by
    /// the 90-day scheduler sweep.
    pub snapshot_token: String,
}

impl Config {
    fn config_path() -> PathBuf {
        config_dir().join("config.yaml")
    }

    /// Load `config.yaml`, deep-merging the document onto defaults.
    /// Missing or unreadable files yield pure defaults.
    pub fn load() -> Self {
        let defaults =
            serde_yaml::to_value(Config::default()).unwrap_or(serde_yaml::Value::Null);
        let merged = match std::fs::read_to_string(Self::config_path()) {
            Ok(raw) => match serde_yaml::from_str::<serde_yaml::Value>(&raw) {
                Ok(user) => deep_merge(defaults, user),
                Err(e) => {
                    tracing::warn!("config.yaml is not valid YAML, using defaults: {}", e);
                    defaults
                }
            },
            Err(_) => defaults,
        };
        serde_yaml::from_value(merged).unwrap_or_default()
    }

    /// Persist the current config back to `config.yaml` (used by token
    /// rotation). Best-effort; failures are logged by the caller.
    pub fn save(&self) -> std::io::Result<()> {
        let dir = config_dir();
        std::fs::create_dir_all(&dir)?;
        let body = serde_yaml::to_string(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let path = Self::config_path();
        std::fs::write(&path, body)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
        }
        Ok(())
    }
}

/// Recursive mapping merge: user values win, unknown user keys are kept.
fn deep_merge(base: serde_yaml::Value, user: serde_yaml::Value) -> serde_yaml::Value {
    match (base, user) {
        (serde_yaml::Value::Mapping(mut base_map), serde_yaml::Value::Mapping(user_map)) => {
            for (key, user_value) in user_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, user_value),
                    None => user_value,
                };
                base_map.insert(key, merged);
            }
            serde_yaml::Value::Mapping(base_map)
        }
        (_, user) => user,
    }
}

// ============================================================================
// PROCESS-WIDE CACHE
// ============================================================================

/// Cached config handle. Cheap to clone; all clones share the cache.
pub struct ConfigHandle {
    cached: RwLock<Config>,
}

impl ConfigHandle {
    pub fn new() -> Self {
        Self {
            cached: RwLock::new(Config::load()),
        }
    }

    /// Current cached config.
    pub fn get(&self) -> Config {
        self.cached
            .read()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Re-read `config.yaml` and return the fresh config.
    pub fn force_reload(&self) -> Config {
        let fresh = Config::load();
        if let Ok(mut slot) = self.cached.write() {
            *slot = fresh.clone();
        }
        fresh
    }

    /// Replace the cached config and persist it.
    pub fn store(&self, config: Config) -> std::io::Result<()> {
        config.save()?;
        if let Ok(mut slot) = self.cached.write() {
            *slot = config;
        }
        Ok(())
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_rates() {
        let config = Config::default();
        assert_eq!(config.decay_rates.semantic, 0.001);
        assert_eq!(config.decay_rates.episodic, 0.05);
        assert_eq!(config.decay_rates.working, 0.3);
        assert_eq!(config.conversation_analysis.promotion_min_score, 0.72);
        assert_eq!(config.conversation_analysis.semantic_dedupe_threshold, 0.92);
        assert!(config.conversation_analysis.require_llm_configured);
    }

    #[test]
    fn deep_merge_keeps_defaults_for_missing_keys() {
        let defaults = serde_yaml::to_value(Config::default()).unwrap();
        let user: serde_yaml::Value =
            serde_yaml::from_str("conversation_analysis:\n  provider: ollama\n").unwrap();
        let merged: Config = serde_yaml::from_value(deep_merge(defaults, user)).unwrap();

        assert_eq!(merged.conversation_analysis.provider, "ollama");
        // Untouched sibling keys keep their defaults.
        assert_eq!(merged.conversation_analysis.auto_interval_hours, 24);
        assert_eq!(merged.decay_rates.working, 0.3);
    }

    #[test]
    fn deep_merge_scalar_override() {
        let defaults = serde_yaml::to_value(Config::default()).unwrap();
        let user: serde_yaml::Value =
            serde_yaml::from_str("decay_rates:\n  working: 0.5\n").unwrap();
        let merged: Config = serde_yaml::from_value(deep_merge(defaults, user)).unwrap();
        assert_eq!(merged.decay_rates.working, 0.5);
        assert_eq!(merged.decay_rates.semantic, 0.001);
    }

    #[test]
    fn level_lookup_defaults_to_semantic() {
        let rates = DecayRates::default();
        assert_eq!(rates.for_level("working"), 0.3);
        assert_eq!(rates.for_level("unknown"), 0.001);
    }
}

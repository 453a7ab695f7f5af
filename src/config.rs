//! Watcher configuration: TOML file loading, CLI overrides, and defaults.
//!
//! Resolution order (first found wins, values merge/override):
//! 1. CLI flags (`--buffer-ms`, `--expand-all`, `--no-initial`)
//! 2. Explicit `--config <file>`
//! 3. `$TREEWATCH_CONFIG` environment variable (path to config file)
//! 4. Project-local `.treewatch.toml` in the current working directory
//! 5. Global `~/.config/treewatch/config.toml`
//! 6. Built-in defaults

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::fs::tree::TreeWatcherOptions;

// ── Section configs ──────────────────────────────────────────────────────────

/// Event delivery settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct WatcherConfig {
    /// Quiet period before a batch of events is emitted. Zero or negative
    /// disables batching.
    pub buffer_delay_ms: Option<i64>,
    /// Capacity of the event broadcast channels.
    pub channel_capacity: Option<usize>,
}

/// Tree behavior settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TreeConfig {
    /// Expand every directory on startup.
    pub expand_all: Option<bool>,
    /// Print the `add` events of initial scans.
    pub show_initial: Option<bool>,
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LogConfig {
    /// Default `tracing` filter directive, e.g. "info" or "tree_watcher=debug".
    pub level: Option<String>,
}

// ── Top-level config ─────────────────────────────────────────────────────────

/// Top-level configuration.
///
/// All fields are optional so that partial configs from different sources
/// can be merged together (CLI overrides file, file overrides defaults).
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub watcher: WatcherConfig,
    pub tree: TreeConfig,
    pub log: LogConfig,
}

// ── Default constants ────────────────────────────────────────────────────────

/// Default event batching delay in milliseconds.
pub const DEFAULT_BUFFER_DELAY_MS: i64 = 50;
/// Default broadcast channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;
/// Default log filter.
pub const DEFAULT_LOG_LEVEL: &str = "warn";

// ── Config file locator ──────────────────────────────────────────────────────

/// Return the list of candidate config file paths in priority order.
///
/// Does NOT include the CLI `--config` path, which is handled separately.
fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Ok(env_path) = std::env::var("TREEWATCH_CONFIG") {
        paths.push(PathBuf::from(env_path));
    }

    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd.join(".treewatch.toml"));
    }

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("treewatch").join("config.toml"));
    }

    paths
}

/// Try to read and parse a TOML config file. Returns `None` if the file
/// doesn't exist or can't be parsed (with a warning printed to stderr).
///
/// Runs before logging is set up, hence `eprintln!`.
fn load_file(path: &Path) -> Option<AppConfig> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str::<AppConfig>(&content) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            eprintln!(
                "Warning: failed to parse config file {}: {}",
                path.display(),
                e
            );
            None
        }
    }
}

// ── Merge logic ──────────────────────────────────────────────────────────────

impl AppConfig {
    /// Merge `other` on top of `self`; `other`'s `Some` values win.
    pub fn merge(self, other: &AppConfig) -> AppConfig {
        AppConfig {
            watcher: WatcherConfig {
                buffer_delay_ms: other
                    .watcher
                    .buffer_delay_ms
                    .or(self.watcher.buffer_delay_ms),
                channel_capacity: other
                    .watcher
                    .channel_capacity
                    .or(self.watcher.channel_capacity),
            },
            tree: TreeConfig {
                expand_all: other.tree.expand_all.or(self.tree.expand_all),
                show_initial: other.tree.show_initial.or(self.tree.show_initial),
            },
            log: LogConfig {
                level: other.log.level.clone().or(self.log.level),
            },
        }
    }

    /// Load the final merged configuration.
    ///
    /// `cli_config_path` is an explicit config file path from `--config`.
    /// `cli_overrides` are partial overrides derived from CLI flags.
    pub fn load(cli_config_path: Option<&Path>, cli_overrides: Option<&AppConfig>) -> AppConfig {
        let mut config = AppConfig::default();

        // Lowest priority first so higher ones overwrite.
        for path in candidate_paths().iter().rev() {
            if let Some(file_cfg) = load_file(path) {
                config = config.merge(&file_cfg);
            }
        }

        if let Some(cli_path) = cli_config_path {
            if let Some(file_cfg) = load_file(cli_path) {
                config = config.merge(&file_cfg);
            }
        }

        if let Some(overrides) = cli_overrides {
            config = config.merge(overrides);
        }

        config
    }

    // ── Convenience getters with built-in defaults ──────────────────────────

    /// Batching delay in milliseconds; may be zero or negative.
    pub fn buffer_delay_ms(&self) -> i64 {
        self.watcher.buffer_delay_ms.unwrap_or(DEFAULT_BUFFER_DELAY_MS)
    }

    /// Batching delay, `None` when batching is disabled.
    pub fn buffer_delay(&self) -> Option<Duration> {
        u64::try_from(self.buffer_delay_ms())
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn channel_capacity(&self) -> usize {
        self.watcher
            .channel_capacity
            .filter(|c| *c > 0)
            .unwrap_or(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn expand_all(&self) -> bool {
        self.tree.expand_all.unwrap_or(false)
    }

    pub fn show_initial(&self) -> bool {
        self.tree.show_initial.unwrap_or(true)
    }

    pub fn log_level(&self) -> &str {
        self.log.level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }

    /// Options for constructing a `TreeWatcher`.
    pub fn watcher_options(&self) -> TreeWatcherOptions {
        TreeWatcherOptions {
            buffer_delay: self.buffer_delay(),
            channel_capacity: self.channel_capacity(),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.buffer_delay_ms(), 50);
        assert_eq!(cfg.buffer_delay(), Some(Duration::from_millis(50)));
        assert_eq!(cfg.channel_capacity(), 1024);
        assert!(!cfg.expand_all());
        assert!(cfg.show_initial());
        assert_eq!(cfg.log_level(), "warn");
        assert_eq!(cfg.watcher_options(), TreeWatcherOptions::default());
    }

    #[test]
    fn test_toml_parsing_full() {
        let toml = r#"
[watcher]
buffer_delay_ms = 250
channel_capacity = 64

[tree]
expand_all = true
show_initial = false

[log]
level = "tree_watcher=debug"
"#;
        let cfg: AppConfig = toml::from_str(toml).expect("parse failed");
        assert_eq!(cfg.buffer_delay(), Some(Duration::from_millis(250)));
        assert_eq!(cfg.channel_capacity(), 64);
        assert!(cfg.expand_all());
        assert!(!cfg.show_initial());
        assert_eq!(cfg.log_level(), "tree_watcher=debug");
    }

    #[test]
    fn test_toml_parsing_partial() {
        let toml = r#"
[tree]
expand_all = true
"#;
        let cfg: AppConfig = toml::from_str(toml).expect("parse failed");
        assert!(cfg.expand_all());
        assert_eq!(cfg.buffer_delay_ms(), 50);
        assert_eq!(cfg.log_level(), "warn");
    }

    #[test]
    fn test_toml_parsing_empty() {
        let cfg: AppConfig = toml::from_str("").expect("parse failed");
        assert_eq!(cfg.channel_capacity(), 1024);
    }

    #[test]
    fn test_non_positive_delay_disables_batching() {
        for delay in [0, -1, -500] {
            let cfg = AppConfig {
                watcher: WatcherConfig {
                    buffer_delay_ms: Some(delay),
                    ..Default::default()
                },
                ..Default::default()
            };
            assert_eq!(cfg.buffer_delay(), None, "delay {}", delay);
            assert_eq!(cfg.watcher_options().buffer_delay, None);
        }
    }

    #[test]
    fn test_zero_capacity_falls_back_to_default() {
        let cfg = AppConfig {
            watcher: WatcherConfig {
                channel_capacity: Some(0),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(cfg.channel_capacity(), 1024);
    }

    #[test]
    fn test_merge_overrides() {
        let base = AppConfig {
            watcher: WatcherConfig {
                buffer_delay_ms: Some(100),
                channel_capacity: Some(16),
            },
            ..Default::default()
        };
        let over = AppConfig {
            watcher: WatcherConfig {
                buffer_delay_ms: Some(0),
                ..Default::default()
            },
            tree: TreeConfig {
                expand_all: Some(true),
                ..Default::default()
            },
            ..Default::default()
        };

        let merged = base.merge(&over);
        assert_eq!(merged.buffer_delay(), None); // overridden
        assert_eq!(merged.channel_capacity(), 16); // from base
        assert!(merged.expand_all());
    }

    #[test]
    fn test_merge_none_does_not_clear_some() {
        let base = AppConfig {
            log: LogConfig {
                level: Some("debug".into()),
            },
            ..Default::default()
        };
        let merged = base.merge(&AppConfig::default());
        assert_eq!(merged.log_level(), "debug");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg_path = dir.path().join("test-config.toml");
        let mut f = std::fs::File::create(&cfg_path).expect("create");
        writeln!(
            f,
            r#"
[watcher]
buffer_delay_ms = 10

[log]
level = "info"
"#
        )
        .expect("write");

        let cfg = load_file(&cfg_path).expect("load");
        assert_eq!(cfg.buffer_delay_ms(), 10);
        assert_eq!(cfg.log_level(), "info");
        assert!(cfg.show_initial());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(load_file(Path::new("/nonexistent/treewatch.toml")).is_none());
    }

    #[test]
    fn test_load_invalid_toml_returns_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg_path = dir.path().join("bad.toml");
        std::fs::write(&cfg_path, "this is { not valid toml").expect("write");
        assert!(load_file(&cfg_path).is_none());
    }

    #[test]
    fn test_load_with_cli_overrides() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg_path = dir.path().join("config.toml");
        std::fs::write(
            &cfg_path,
            r#"
[watcher]
buffer_delay_ms = 75
channel_capacity = 8
"#,
        )
        .expect("write");

        let cli_overrides = AppConfig {
            watcher: WatcherConfig {
                buffer_delay_ms: Some(5),
                ..Default::default()
            },
            ..Default::default()
        };

        let cfg = AppConfig::load(Some(&cfg_path), Some(&cli_overrides));
        // CLI override wins
        assert_eq!(cfg.buffer_delay_ms(), 5);
        // File value preserved
        assert_eq!(cfg.channel_capacity(), 8);
    }
}

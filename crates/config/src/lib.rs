//! Layered configuration for the build cache.
//!
//! Values are merged in this order, later sources winning:
//!
//! 1. Built-in defaults
//! 2. `config.{toml,yaml,json}` in the user's config directory
//! 3. `kosh.{toml,yaml,json}` in the project directory
//! 4. `KOSH_`-prefixed environment variables, with `__` separating sections
//!    (`KOSH_GC__MIN_BUILDS=5`, `KOSH_CACHE__DEV_MODE=true`)

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
pub use kosh_compress::Thresholds;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "KOSH_";
const PROJECT_FILE_STEM: &str = "kosh";
const USER_FILE_STEM: &str = "config";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheSettings,
    /// Compression tiers for the content store.
    pub store: Thresholds,
    pub gc: GcSettings,
    pub adapter: AdapterSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Cache directory; relative paths resolve against the project directory.
    pub root: PathBuf,
    /// Watch/serve mode: enables the in-memory read cache.
    pub dev_mode: bool,
    /// Lifetime of an entry in the in-memory read cache.
    pub memo_ttl_ms: u64,
    /// Rendered HTML smaller than this is kept inline in the post record.
    pub inline_html_threshold: usize,
    /// How many posts a quick verification pass samples.
    pub quick_verify_samples: usize,
}
impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".kosh-cache"),
            dev_mode: false,
            memo_ttl_ms: 30_000,
            inline_html_threshold: 32 * 1024,
            quick_verify_samples: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcSettings {
    /// Propose a collection once this fraction of stored bytes is unreachable.
    pub dead_bytes_threshold: f64,
    /// Never propose a collection more often than every this many builds.
    pub min_builds: u64,
    /// Report what would be deleted without deleting anything.
    pub dry_run: bool,
}
impl Default for GcSettings {
    fn default() -> Self {
        Self { dead_bytes_threshold: 0.30, min_builds: 10, dry_run: false }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterSettings {
    /// Write-behind workers; defaults to the number of CPUs.
    pub workers: Option<usize>,
    /// Queue capacity as a multiple of the worker count.
    pub queue_factor: usize,
}
impl Default for AdapterSettings {
    fn default() -> Self {
        Self { workers: None, queue_factor: 4 }
    }
}
impl AdapterSettings {
    /// Effective worker count, never fewer than two.
    pub fn worker_count(&self) -> usize {
        self.workers
            .unwrap_or_else(|| std::thread::available_parallelism().map(usize::from).unwrap_or(2))
            .max(2)
    }

    pub fn queue_capacity(&self) -> usize {
        self.worker_count() * self.queue_factor.max(1)
    }
}

impl Config {
    /// Load configuration for the project rooted at `project_dir`.
    pub fn load(project_dir: impl AsRef<Path>) -> Result<Self> {
        let project_dir = project_dir.as_ref();
        let user_dir = ProjectDirs::from("dev", "kosh", "kosh").map(|dirs| dirs.config_dir().to_path_buf());
        let figment = Self::figment(user_dir.as_deref(), project_dir).merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::extract(figment, project_dir)
    }

    /// Defaults plus file sources, without the environment.
    fn figment(user_dir: Option<&Path>, project_dir: &Path) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(dir) = user_dir {
            figment = Self::merge_files(figment, dir, USER_FILE_STEM);
        }
        Self::merge_files(figment, project_dir, PROJECT_FILE_STEM)
    }

    fn merge_files(figment: Figment, dir: &Path, stem: &str) -> Figment {
        // Missing files are skipped by figment's file providers.
        figment
            .merge(Toml::file(dir.join(format!("{stem}.toml"))))
            .merge(Yaml::file(dir.join(format!("{stem}.yaml"))))
            .merge(Json::file(dir.join(format!("{stem}.json"))))
    }

    fn extract(figment: Figment, project_dir: &Path) -> Result<Self> {
        let mut config: Config = figment.extract().or_raise(|| ErrorKind::Load)?;
        if config.cache.root.is_relative() {
            config.cache.root = project_dir.join(&config.cache.root);
        }
        config.validate()?;
        tracing::debug!(root = %config.cache.root.display(), dev_mode = config.cache.dev_mode, "loaded configuration");
        Ok(config)
    }

    /// Reject values that would make the cache misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.store.raw > self.store.fast {
            exn::bail!(ErrorKind::Invalid(format!(
                "store.raw ({}) must not exceed store.fast ({})",
                self.store.raw, self.store.fast
            )));
        }
        let ratio = self.gc.dead_bytes_threshold;
        if !(ratio > 0.0 && ratio <= 1.0) {
            exn::bail!(ErrorKind::Invalid(format!("gc.dead_bytes_threshold ({ratio}) must be within (0, 1]")));
        }
        if self.adapter.workers == Some(0) {
            exn::bail!(ErrorKind::Invalid("adapter.workers must be at least 1".to_string()));
        }
        if self.adapter.queue_factor == 0 {
            exn::bail!(ErrorKind::Invalid("adapter.queue_factor must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn load_files(project_dir: &Path) -> Result<Config> {
        Config::extract(Config::figment(None, project_dir), project_dir)
    }

    #[test]
    fn test_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_files(dir.path()).unwrap();
        assert_eq!(config.cache.root, dir.path().join(".kosh-cache"));
        assert_eq!(config.cache.inline_html_threshold, 32 * 1024);
        assert_eq!(config.store, Thresholds { raw: 512, fast: 64 * 1024 });
        assert_eq!(config.gc.min_builds, 10);
        assert!((config.gc.dead_bytes_threshold - 0.30).abs() < f64::EPSILON);
        assert!(!config.gc.dry_run);
    }

    #[test]
    fn test_project_toml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("kosh.toml"),
            "[cache]\ndev_mode = true\nroot = \"/tmp/kosh\"\n\n[gc]\nmin_builds = 3\n",
        )
        .unwrap();
        let config = load_files(dir.path()).unwrap();
        assert!(config.cache.dev_mode);
        assert_eq!(config.cache.root, PathBuf::from("/tmp/kosh"));
        assert_eq!(config.gc.min_builds, 3);
        // Untouched values keep their defaults.
        assert_eq!(config.cache.quick_verify_samples, 10);
    }

    #[test]
    fn test_user_file_is_overridden_by_project_file() {
        let user = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        std::fs::write(user.path().join("config.yaml"), "gc:\n  min_builds: 7\n  dry_run: true\n").unwrap();
        std::fs::write(project.path().join("kosh.json"), r#"{"gc": {"min_builds": 2}}"#).unwrap();
        let figment = Config::figment(Some(user.path()), project.path());
        let config = Config::extract(figment, project.path()).unwrap();
        assert_eq!(config.gc.min_builds, 2);
        assert!(config.gc.dry_run);
    }

    #[rstest]
    #[case("[store]\nraw = 1000\nfast = 10\n")]
    #[case("[gc]\ndead_bytes_threshold = 0.0\n")]
    #[case("[gc]\ndead_bytes_threshold = 1.5\n")]
    #[case("[adapter]\nworkers = 0\n")]
    #[case("[adapter]\nqueue_factor = 0\n")]
    fn test_invalid_values(#[case] toml: &str) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kosh.toml"), toml).unwrap();
        let err = load_files(dir.path()).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Invalid(_)));
    }

    #[test]
    fn test_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kosh.toml"), "[gc\nmin_builds = ").unwrap();
        let err = load_files(dir.path()).unwrap_err();
        assert_eq!(*err, ErrorKind::Load);
    }

    #[rstest]
    #[case(Some(1), 2)]
    #[case(Some(8), 8)]
    fn test_worker_count_floor(#[case] workers: Option<usize>, #[case] expected: usize) {
        let settings = AdapterSettings { workers, queue_factor: 4 };
        assert_eq!(settings.worker_count(), expected);
        assert_eq!(settings.queue_capacity(), expected * 4);
    }

    #[test]
    fn test_default_worker_count_is_at_least_two() {
        assert!(AdapterSettings::default().worker_count() >= 2);
    }
}

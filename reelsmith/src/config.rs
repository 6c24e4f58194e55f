//! Orchestrator configuration.
//!
//! Values come from an optional TOML file, then environment variables, then
//! the runtime settings persisted in the database.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::classifier::RuleConfig;
use crate::database::repositories::SettingsRepository;
use crate::database::repositories::settings::{SETTING_MAX_RETRIES, SETTING_POLL_INTERVAL_MS};
use crate::domain::StageKind;
use crate::pipeline::{BatchPolicy, PollerConfig};
use crate::recovery::RecoveryConfig;
use crate::supervisor::{ArtifactSpec, SupervisorConfig, WorkerTemplate};
use crate::{Error, Result};

pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_WORK_DIR: &str = "REELSMITH_WORK_DIR";
pub const ENV_LOG_DIR: &str = "REELSMITH_LOG_DIR";
pub const ENV_MAX_RETRIES: &str = "REELSMITH_MAX_RETRIES";
pub const ENV_POLL_INTERVAL_MS: &str = "REELSMITH_POLL_INTERVAL_MS";
pub const ENV_JOB_TIMEOUT_SECS: &str = "REELSMITH_JOB_TIMEOUT_SECS";
pub const ENV_MAX_CONCURRENT: &str = "REELSMITH_MAX_CONCURRENT";

/// Terminal-job retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub purge_after_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            purge_after_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub database_url: String,
    pub log_dir: PathBuf,
    pub supervisor: SupervisorConfig,
    pub recovery: RecoveryConfig,
    pub poller: PollerConfig,
    pub batch: BatchPolicy,
    /// Classifier rules, first match wins. Empty means the built-in table.
    pub rules: Vec<RuleConfig>,
    /// Worker catalog keyed by stage kind (`script`, `video`, ...).
    pub workers: HashMap<StageKind, WorkerTemplate>,
    pub retention: RetentionConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:reelsmith.db?mode=rwc".to_string(),
            log_dir: PathBuf::from("./logs"),
            supervisor: SupervisorConfig::default(),
            recovery: RecoveryConfig::default(),
            poller: PollerConfig::default(),
            batch: BatchPolicy::default(),
            rules: Vec::new(),
            workers: default_workers(),
            retention: RetentionConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Parse a TOML document. Missing sections keep their defaults; a
    /// `[workers]` table replaces the whole default catalog.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::io_path("reading config file", path, e))?;
        Self::from_toml(&content)
    }

    /// File (if given) plus process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_DATABASE_URL) {
            self.database_url = url;
        }
        if let Some(dir) = lookup(ENV_WORK_DIR) {
            self.supervisor.work_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(ENV_LOG_DIR) {
            self.log_dir = PathBuf::from(dir);
        }
        if let Some(value) = lookup(ENV_MAX_RETRIES) {
            self.recovery.retry.max_retries = parse_env(ENV_MAX_RETRIES, &value)?;
        }
        if let Some(value) = lookup(ENV_POLL_INTERVAL_MS) {
            self.poller.poll_interval_ms = parse_env(ENV_POLL_INTERVAL_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_JOB_TIMEOUT_SECS) {
            self.supervisor.job_timeout_secs = parse_env(ENV_JOB_TIMEOUT_SECS, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_CONCURRENT) {
            self.poller.max_concurrent = parse_env(ENV_MAX_CONCURRENT, &value)?;
        }
        Ok(())
    }

    /// Override file/env values with the settings persisted in the database.
    pub async fn apply_persisted_settings(&mut self, settings: &dyn SettingsRepository) {
        match settings.get_setting(SETTING_MAX_RETRIES).await {
            Ok(Some(value)) => match value.trim().parse() {
                Ok(max_retries) => {
                    info!(max_retries, "Applied persisted max_retries");
                    self.recovery.retry.max_retries = max_retries;
                }
                Err(_) => warn!(value = %value, "Ignoring invalid persisted max_retries"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to load persisted max_retries"),
        }

        match settings.get_setting(SETTING_POLL_INTERVAL_MS).await {
            Ok(Some(value)) => match value.trim().parse() {
                Ok(poll_interval_ms) => {
                    info!(poll_interval_ms, "Applied persisted poll_interval_ms");
                    self.poller.poll_interval_ms = poll_interval_ms;
                }
                Err(_) => warn!(value = %value, "Ignoring invalid persisted poll_interval_ms"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to load persisted poll_interval_ms"),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(Error::config("database_url cannot be empty"));
        }
        if self.poller.max_concurrent == 0 {
            return Err(Error::config("poller.max_concurrent cannot be 0"));
        }
        if let Some((kind, _)) = self.poller.kind_limits.iter().find(|(_, limit)| **limit == 0) {
            return Err(Error::config(format!("poller.kind_limits.{kind} cannot be 0")));
        }
        if self.supervisor.job_timeout_secs == 0 {
            return Err(Error::config("supervisor.job_timeout_secs cannot be 0"));
        }
        if let Some(ratio) = self.batch.min_ratio
            && !(0.0..=1.0).contains(&ratio)
        {
            return Err(Error::config(format!(
                "batch.min_ratio must be within 0.0..=1.0, got {ratio}"
            )));
        }
        if self.recovery.retry.backoff_multiplier < 1.0 {
            return Err(Error::config("retry.backoff_multiplier must be >= 1.0"));
        }
        for (kind, worker) in &self.workers {
            if worker.program.trim().is_empty() {
                return Err(Error::config(format!("worker for {kind} has no program")));
            }
        }
        for rule in &self.rules {
            rule.to_rule()?;
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("{key} has an invalid value: {value:?}")))
}

/// Python worker scripts run from the job work directory.
fn default_workers() -> HashMap<StageKind, WorkerTemplate> {
    HashMap::from([
        (
            StageKind::Script,
            WorkerTemplate::new("python")
                .with_args([
                    "open_claude_auto.py",
                    "--title",
                    "{title}",
                    "--output",
                    "{work_dir}/script.json",
                ])
                .with_artifact(ArtifactSpec::file("script.json").as_json()),
        ),
        (
            StageKind::Video,
            WorkerTemplate::new("python")
                .with_args([
                    "create_video_from_folder.py",
                    "--folder",
                    "{work_dir}",
                    "--script",
                    "{input}",
                ])
                .with_artifact(
                    ArtifactSpec {
                        candidates: vec!["{slug}.mp4".to_string(), "merged.mp4".to_string()],
                        ..Default::default()
                    }
                    .with_extension("mp4")
                    .excluding(["scene_"]),
                ),
        ),
        (
            StageKind::Upload,
            WorkerTemplate::new("python").with_args([
                "youtube_upload_cli.py",
                "--action",
                "upload",
                "--video",
                "{input}",
                "--title",
                "{title}",
            ]),
        ),
        (
            StageKind::Publish,
            WorkerTemplate::new("python").with_args([
                "youtube_upload_cli.py",
                "--action",
                "publish",
                "--job",
                "{job_id}",
            ]),
        ),
        (
            StageKind::Crawl,
            WorkerTemplate::new("python").with_args([
                "image_crawler_working.py",
                "--query",
                "{item}",
                "--output",
                "{work_dir}",
            ]),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn defaults_cover_every_stage() {
        let config = OrchestratorConfig::default();
        for kind in [
            StageKind::Script,
            StageKind::Video,
            StageKind::Upload,
            StageKind::Publish,
            StageKind::Crawl,
        ] {
            assert!(config.workers.contains_key(&kind), "missing {kind}");
        }
        assert!(config.validate().is_ok());
        assert!(config.workers[&StageKind::Script].artifact.as_ref().unwrap().json);
    }

    #[test]
    fn toml_sections_override_defaults() {
        let config = OrchestratorConfig::from_toml(
            r#"
            database_url = "sqlite:/tmp/x.db?mode=rwc"

            [supervisor]
            job_timeout_secs = 60

            [recovery.retry]
            max_retries = 5

            [poller]
            max_concurrent = 8

            [batch]
            min_ratio = 0.5

            [[rules]]
            keywords = ["rendering"]
            step = "render"
            floor = 70

            [workers.video]
            program = "sh"
            args = ["-c", "echo {title}"]
            "#,
        )
        .unwrap();

        assert_eq!(config.database_url, "sqlite:/tmp/x.db?mode=rwc");
        assert_eq!(config.supervisor.job_timeout(), Duration::from_secs(60));
        assert_eq!(config.supervisor.stderr_tail_lines, 20);
        assert_eq!(config.recovery.retry.max_retries, 5);
        assert_eq!(config.poller.max_concurrent, 8);
        assert_eq!(config.batch.min_ratio, Some(0.5));
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.workers.len(), 1);
        assert_eq!(config.workers[&StageKind::Video].program, "sh");
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = OrchestratorConfig::default();
        let env = HashMap::from([
            (ENV_DATABASE_URL, "sqlite::memory:"),
            (ENV_WORK_DIR, "/srv/work"),
            (ENV_MAX_RETRIES, "7"),
            (ENV_POLL_INTERVAL_MS, "250"),
            (ENV_JOB_TIMEOUT_SECS, "90"),
            (ENV_MAX_CONCURRENT, "3"),
        ]);
        config
            .apply_env_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.supervisor.work_dir, PathBuf::from("/srv/work"));
        assert_eq!(config.recovery.retry.max_retries, 7);
        assert_eq!(config.poller.poll_interval_ms, 250);
        assert_eq!(config.supervisor.job_timeout_secs, 90);
        assert_eq!(config.poller.max_concurrent, 3);
    }

    #[test]
    fn invalid_env_value_is_a_config_error() {
        let mut config = OrchestratorConfig::default();
        let err = config
            .apply_env_overrides(|key| (key == ENV_MAX_RETRIES).then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = OrchestratorConfig::default();
        config.poller.max_concurrent = 0;
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.batch.min_ratio = Some(1.5);
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::default();
        config.poller.kind_limits.insert(StageKind::Upload, 0);
        assert!(config.validate().is_err());

        assert!(OrchestratorConfig::from_toml("[[rules]]\nstep = \"x\"\nfloor = 1").is_err());
    }
}

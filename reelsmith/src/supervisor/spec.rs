//! Worker templates and their per-run rendering.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::artifact::ArtifactSpec;
use crate::domain::StageKind;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-z_]+(?:\.[A-Za-z0-9_\-]+)?)\}").unwrap());

/// How to run the worker of one stage kind, as configured.
///
/// `args`, `env` values and the artifact fields may contain placeholders:
/// `{job_id}`, `{stage}`, `{work_dir}`, `{input}`, `{title}`, `{slug}`,
/// `{item}`, `{item_index}` and `{payload.<key>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub artifact: Option<ArtifactSpec>,
    /// Overrides the supervisor's default wall-clock limit.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl WorkerTemplate {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            artifact: None,
            timeout_secs: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_artifact(mut self, artifact: ArtifactSpec) -> Self {
        self.artifact = Some(artifact);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Substitute every placeholder for one run.
    pub fn render(&self, ctx: &TemplateContext<'_>, default_timeout: Duration) -> WorkerSpec {
        let artifact = self.artifact.as_ref().map(|a| ArtifactSpec {
            dir: a.dir.as_deref().map(|d| ctx.substitute(d)),
            candidates: a.candidates.iter().map(|c| ctx.substitute(c)).collect(),
            extension: a.extension.clone(),
            exclude: a.exclude.clone(),
            json: a.json,
        });

        WorkerSpec {
            stage: ctx.stage,
            program: ctx.substitute(&self.program),
            args: self.args.iter().map(|a| ctx.substitute(a)).collect(),
            env: self
                .env
                .iter()
                .map(|(k, v)| (k.clone(), ctx.substitute(v)))
                .collect(),
            work_dir: ctx.work_dir.to_path_buf(),
            timeout: self
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(default_timeout),
            artifact,
        }
    }
}

/// A fully rendered worker invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSpec {
    pub stage: StageKind,
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub work_dir: PathBuf,
    pub timeout: Duration,
    pub artifact: Option<ArtifactSpec>,
}

/// Values available to placeholders.
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    pub job_id: &'a str,
    pub stage: StageKind,
    pub work_dir: &'a Path,
    /// Artifact of the previous stage.
    pub input: Option<&'a str>,
    pub title: &'a str,
    pub payload: &'a Value,
    /// `(1-based index, item)` for batch runs.
    pub item: Option<(u32, &'a str)>,
}

impl TemplateContext<'_> {
    fn value_of(&self, key: &str) -> Option<String> {
        if let Some(field) = key.strip_prefix("payload.") {
            return self.payload.get(field).map(|v| match v {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            });
        }
        let value = match key {
            "job_id" => self.job_id.to_string(),
            "stage" => self.stage.as_str().to_string(),
            "work_dir" => self.work_dir.display().to_string(),
            "input" => self.input.unwrap_or_default().to_string(),
            "title" => self.title.to_string(),
            "slug" => slugify(self.title),
            "item" => self.item.map(|(_, item)| item.to_string()).unwrap_or_default(),
            "item_index" => self
                .item
                .map(|(index, _)| index.to_string())
                .unwrap_or_default(),
            _ => return None,
        };
        Some(value)
    }

    /// Replace known placeholders; unknown ones are left as written.
    pub fn substitute(&self, template: &str) -> String {
        PLACEHOLDER
            .replace_all(template, |caps: &Captures<'_>| {
                self.value_of(&caps[1])
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }
}

/// File-name-safe form of a title: alphanumerics kept, runs of anything
/// else collapsed to `_`.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_sep = false;
    for c in title.trim().chars() {
        if c.is_alphanumeric() || c == '-' {
            if pending_sep && !slug.is_empty() {
                slug.push('_');
            }
            pending_sep = false;
            slug.push(c);
        } else {
            pending_sep = true;
        }
    }
    if slug.is_empty() {
        slug.push_str("untitled");
    }
    slug
}

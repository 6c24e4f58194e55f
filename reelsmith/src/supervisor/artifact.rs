//! Post-exit artifact verification.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::WorkerFailure;
use crate::utils::fs::is_non_empty_file;

/// Where a worker is expected to leave its output.
///
/// Lookup order: each name in `candidates` inside `dir`, then the first file
/// (by name) in `dir` with `extension` whose name contains none of the
/// `exclude` fragments. Empty files never count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSpec {
    /// Relative to the job work dir unless absolute.
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default)]
    pub candidates: Vec<String>,
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Validate (and normalize) the artifact as JSON.
    #[serde(default)]
    pub json: bool,
}

impl ArtifactSpec {
    pub fn file(name: impl Into<String>) -> Self {
        Self {
            candidates: vec![name.into()],
            ..Default::default()
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    pub fn excluding<I, S>(mut self, fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude = fragments.into_iter().map(Into::into).collect();
        self
    }

    pub fn as_json(mut self) -> Self {
        self.json = true;
        self
    }

    fn describe(&self, dir: &Path) -> String {
        let mut parts: Vec<String> = self
            .candidates
            .iter()
            .map(|c| dir.join(c).display().to_string())
            .collect();
        if let Some(ext) = &self.extension {
            parts.push(format!("{}/*.{}", dir.display(), ext.trim_start_matches('.')));
        }
        if parts.is_empty() {
            dir.display().to_string()
        } else {
            parts.join(", ")
        }
    }
}

/// Locate the artifact and, for JSON artifacts, validate it.
pub async fn verify(spec: &ArtifactSpec, work_dir: &Path) -> Result<PathBuf, WorkerFailure> {
    let dir = match &spec.dir {
        Some(dir) => work_dir.join(dir),
        None => work_dir.to_path_buf(),
    };

    let path = locate(spec, &dir)
        .await
        .ok_or_else(|| WorkerFailure::ArtifactNotFound {
            expected: spec.describe(&dir),
        })?;

    if spec.json {
        normalize_json(&path).await?;
    }
    debug!(path = %path.display(), "Artifact verified");
    Ok(path)
}

async fn locate(spec: &ArtifactSpec, dir: &Path) -> Option<PathBuf> {
    for candidate in &spec.candidates {
        let path = dir.join(candidate);
        if is_non_empty_file(&path).await {
            return Some(path);
        }
    }

    let extension = spec.extension.as_deref()?.trim_start_matches('.');
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let mut names = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        let matches_ext = Path::new(&name)
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case(extension));
        if matches_ext && !spec.exclude.iter().any(|f| name.contains(f.as_str())) {
            names.push(name);
        }
    }
    names.sort();

    for name in names {
        let path = dir.join(name);
        if is_non_empty_file(&path).await {
            return Some(path);
        }
    }
    None
}

/// Decode leniently; rewrite the file when a repair was needed.
async fn normalize_json(path: &Path) -> Result<(), WorkerFailure> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
        WorkerFailure::MalformedArtifact {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }
    })?;

    let (value, modified) =
        lenient_json::decode(&raw)
            .into_result()
            .map_err(|e| WorkerFailure::MalformedArtifact {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

    if modified {
        let pretty = serde_json::to_string_pretty(&value).map_err(|e| {
            WorkerFailure::MalformedArtifact {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        })?;
        tokio::fs::write(path, pretty)
            .await
            .map_err(|e| WorkerFailure::TransientInfra(format!(
                "failed to rewrite repaired artifact {}: {}",
                path.display(),
                e
            )))?;
        info!(path = %path.display(), "Repaired malformed JSON artifact");
    }
    Ok(())
}

//! Schema change analysis and version calculation.
//!
//! Compares a current set of proto files to a baseline set, classifies the
//! change (`breaking > feature > fix > docs`), and computes the next
//! semantic version. The rules are language-independent: files are compared
//! by content digest, and only the external breaking-change detector ever
//! looks inside them.

pub mod buf_breaking;
mod version;

pub use version::{latest_in_tags, Version};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use protodist_core::{Digest, Error, Result};

/// Change classes, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeClass {
    /// Documentation-only change.
    Docs,
    /// Compatible fix.
    Fix,
    /// Compatible addition.
    Feature,
    /// Incompatible change.
    Breaking,
}

/// The version component a change set bumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BumpKind {
    /// No version change.
    None,
    /// Patch bump.
    Patch,
    /// Minor bump.
    Minor,
    /// Major bump.
    Major,
}

impl From<ChangeClass> for BumpKind {
    fn from(class: ChangeClass) -> Self {
        match class {
            ChangeClass::Breaking => Self::Major,
            ChangeClass::Feature => Self::Minor,
            ChangeClass::Fix | ChangeClass::Docs => Self::Patch,
        }
    }
}

/// One detected schema change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaChange {
    /// The file the change is about.
    pub path: String,
    /// Classification.
    pub class: ChangeClass,
    /// Human-readable detail.
    pub detail: String,
}

/// The outcome of analysing current against baseline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionPlan {
    /// The computed next version.
    pub next_version: Version,
    /// Which component was bumped.
    pub bump: BumpKind,
    /// The changes, ordered most severe first.
    pub changes: Vec<SchemaChange>,
}

/// A set of proto files keyed by relative path, valued by content digest.
pub type FileSet = BTreeMap<String, Digest>;

/// Collect the proto files under a directory into a [`FileSet`].
///
/// # Errors
///
/// Returns an error if the walk or hashing fails.
pub fn collect_file_set(dir: &Path) -> Result<FileSet> {
    let mut set = FileSet::new();
    for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::internal(format!("directory walk failed: {e}")))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.path().extension().and_then(|e| e.to_str()) != Some("proto") {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| Error::internal(format!("path outside walk root: {e}")))?
            .to_string_lossy()
            .replace('\\', "/");
        set.insert(relative, Digest::from_file(entry.path())?);
    }
    Ok(set)
}

/// Version analyzer.
///
/// Holds the path of the external breaking-change detector, when one is
/// available; everything else is pure.
#[derive(Debug, Clone, Default)]
pub struct VersionAnalyzer {
    buf_program: Option<PathBuf>,
}

impl VersionAnalyzer {
    /// Create an analyzer without a breaking-change detector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a buf binary for breaking-change detection on modified files.
    #[must_use]
    pub fn with_buf_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.buf_program = Some(program.into());
        self
    }

    /// Analyse a current tree against a baseline tree and compute the next
    /// version.
    ///
    /// With no baseline the set is treated as initial: `v1.0.0`, classified
    /// as a feature.
    ///
    /// # Errors
    ///
    /// Returns an error if file hashing or the external detector fails.
    pub async fn analyze(
        &self,
        current_dir: &Path,
        baseline_dir: Option<&Path>,
        current_version: Option<&Version>,
    ) -> Result<VersionPlan> {
        let Some(baseline_dir) = baseline_dir else {
            info!("No baseline; treating as initial version");
            return Ok(VersionPlan {
                next_version: Version::initial(),
                bump: BumpKind::Minor,
                changes: vec![SchemaChange {
                    path: String::new(),
                    class: ChangeClass::Feature,
                    detail: "initial schema set".to_string(),
                }],
            });
        };

        let current = collect_file_set(current_dir)?;
        let baseline = collect_file_set(baseline_dir)?;
        let mut changes = diff_file_sets(&current, &baseline);

        // Modified files default to fix; the external detector upgrades them
        // to breaking when it finds a violation.
        if let Some(buf_program) = &self.buf_program {
            let any_modified = changes
                .iter()
                .any(|c| c.class == ChangeClass::Fix && c.detail.starts_with("modified"));
            if any_modified {
                let report =
                    buf_breaking::check(buf_program, current_dir, baseline_dir).await?;
                if !report.violations.is_empty() {
                    for violation in &report.violations {
                        changes.push(SchemaChange {
                            path: String::new(),
                            class: ChangeClass::Breaking,
                            detail: violation.clone(),
                        });
                    }
                }
            }
        }

        changes.sort_by(|a, b| b.class.cmp(&a.class));
        let bump = match changes.iter().map(|c| c.class).max() {
            Some(class) => BumpKind::from(class),
            None => BumpKind::None,
        };

        let base = current_version.cloned().unwrap_or_else(Version::initial);
        let next_version = if current_version.is_none() {
            Version::initial()
        } else {
            base.bump(bump)
        };
        debug!(?bump, next = %next_version, changes = changes.len(), "Computed version plan");

        Ok(VersionPlan {
            next_version,
            bump,
            changes,
        })
    }
}

/// Diff two file sets by the language-independent rules: added is a
/// feature, removed is breaking, content change is a fix.
#[must_use]
pub fn diff_file_sets(current: &FileSet, baseline: &FileSet) -> Vec<SchemaChange> {
    let mut changes = Vec::new();
    for (path, digest) in current {
        match baseline.get(path) {
            None => changes.push(SchemaChange {
                path: path.clone(),
                class: ChangeClass::Feature,
                detail: format!("added {path}"),
            }),
            Some(old) if old != digest => changes.push(SchemaChange {
                path: path.clone(),
                class: ChangeClass::Fix,
                detail: format!("modified {path}"),
            }),
            Some(_) => {}
        }
    }
    for path in baseline.keys() {
        if !current.contains_key(path) {
            changes.push(SchemaChange {
                path: path.clone(),
                class: ChangeClass::Breaking,
                detail: format!("removed {path}"),
            });
        }
    }
    changes
}

/// Check a candidate version against the latest version in each target
/// repository.
///
/// # Errors
///
/// Returns [`precondition-failed`](protodist_core::ErrorKind::PreconditionFailed)
/// naming the first target whose latest version is not strictly below the
/// candidate.
pub fn ensure_greater(
    candidate: &Version,
    latest_by_target: &BTreeMap<String, Option<Version>>,
) -> Result<()> {
    for (target, latest) in latest_by_target {
        if let Some(latest) = latest {
            if candidate <= latest {
                return Err(Error::precondition(format!(
                    "version {candidate} is not greater than {latest} already in {target}"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn set(entries: &[(&str, &[u8])]) -> FileSet {
        entries
            .iter()
            .map(|(path, content)| ((*path).to_string(), Digest::from_bytes(content)))
            .collect()
    }

    #[test]
    fn test_diff_added_is_feature() {
        let changes = diff_file_sets(&set(&[("a.proto", b"a"), ("b.proto", b"b")]), &set(&[("a.proto", b"a")]));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].class, ChangeClass::Feature);
        assert_eq!(changes[0].path, "b.proto");
    }

    #[test]
    fn test_diff_removed_is_breaking() {
        let changes = diff_file_sets(&set(&[]), &set(&[("a.proto", b"a")]));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].class, ChangeClass::Breaking);
    }

    #[test]
    fn test_diff_modified_is_fix() {
        let changes = diff_file_sets(&set(&[("a.proto", b"new")]), &set(&[("a.proto", b"old")]));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].class, ChangeClass::Fix);
    }

    #[test]
    fn test_diff_unchanged_is_silent() {
        let changes = diff_file_sets(&set(&[("a.proto", b"same")]), &set(&[("a.proto", b"same")]));
        assert!(changes.is_empty());
    }

    #[test]
    fn test_severity_order() {
        assert!(ChangeClass::Breaking > ChangeClass::Feature);
        assert!(ChangeClass::Feature > ChangeClass::Fix);
        assert!(ChangeClass::Fix > ChangeClass::Docs);
    }

    #[test]
    fn test_bump_mapping() {
        assert_eq!(BumpKind::from(ChangeClass::Breaking), BumpKind::Major);
        assert_eq!(BumpKind::from(ChangeClass::Feature), BumpKind::Minor);
        assert_eq!(BumpKind::from(ChangeClass::Fix), BumpKind::Patch);
        assert_eq!(BumpKind::from(ChangeClass::Docs), BumpKind::Patch);
    }

    #[tokio::test]
    async fn test_removed_file_bumps_major() {
        let baseline = TempDir::new().unwrap();
        std::fs::write(baseline.path().join("a.proto"), b"syntax").unwrap();
        let current = TempDir::new().unwrap();

        let analyzer = VersionAnalyzer::new();
        let plan = analyzer
            .analyze(
                current.path(),
                Some(baseline.path()),
                Some(&Version::new(1, 4, 2)),
            )
            .await
            .unwrap();

        assert_eq!(plan.bump, BumpKind::Major);
        assert_eq!(plan.next_version, Version::new(2, 0, 0));
        assert_eq!(plan.changes[0].class, ChangeClass::Breaking);
    }

    #[tokio::test]
    async fn test_added_file_bumps_minor() {
        let baseline = TempDir::new().unwrap();
        std::fs::write(baseline.path().join("a.proto"), b"syntax").unwrap();
        let current = TempDir::new().unwrap();
        std::fs::write(current.path().join("a.proto"), b"syntax").unwrap();
        std::fs::write(current.path().join("b.proto"), b"more").unwrap();

        let plan = VersionAnalyzer::new()
            .analyze(
                current.path(),
                Some(baseline.path()),
                Some(&Version::new(1, 4, 2)),
            )
            .await
            .unwrap();
        assert_eq!(plan.bump, BumpKind::Minor);
        assert_eq!(plan.next_version, Version::new(1, 5, 0));
    }

    #[tokio::test]
    async fn test_no_changes_keeps_version() {
        let baseline = TempDir::new().unwrap();
        std::fs::write(baseline.path().join("a.proto"), b"syntax").unwrap();
        let current = TempDir::new().unwrap();
        std::fs::write(current.path().join("a.proto"), b"syntax").unwrap();

        let plan = VersionAnalyzer::new()
            .analyze(
                current.path(),
                Some(baseline.path()),
                Some(&Version::new(1, 4, 2)),
            )
            .await
            .unwrap();
        assert_eq!(plan.bump, BumpKind::None);
        assert_eq!(plan.next_version, Version::new(1, 4, 2));
        assert!(plan.changes.is_empty());
    }

    #[tokio::test]
    async fn test_no_baseline_is_initial_feature() {
        let current = TempDir::new().unwrap();
        std::fs::write(current.path().join("a.proto"), b"syntax").unwrap();

        let plan = VersionAnalyzer::new()
            .analyze(current.path(), None, None)
            .await
            .unwrap();
        assert_eq!(plan.next_version, Version::initial());
        assert_eq!(plan.changes[0].class, ChangeClass::Feature);
    }

    #[test]
    fn test_ensure_greater_accepts_and_rejects() {
        let mut targets = BTreeMap::new();
        targets.insert("oras.birb.homes".to_string(), Some(Version::new(2, 0, 1)));
        targets.insert("backup.example.org".to_string(), None);

        // v2.0.0 <= v2.0.1 in the first target.
        let err = ensure_greater(&Version::new(2, 0, 0), &targets).unwrap_err();
        assert_eq!(err.kind(), protodist_core::ErrorKind::PreconditionFailed);
        assert!(err.to_string().contains("oras.birb.homes"));

        ensure_greater(&Version::new(2, 0, 2), &targets).unwrap();
    }

    #[test]
    fn test_collect_file_set_only_protos() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("nested")).unwrap();
        std::fs::write(tmp.path().join("a.proto"), b"a").unwrap();
        std::fs::write(tmp.path().join("nested/b.proto"), b"b").unwrap();
        std::fs::write(tmp.path().join("README.md"), b"docs").unwrap();

        let set = collect_file_set(tmp.path()).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains_key("a.proto"));
        assert!(set.contains_key("nested/b.proto"));
    }

    #[test]
    fn test_changes_sorted_most_severe_first() {
        let current = set(&[("new.proto", b"n"), ("mod.proto", b"v2")]);
        let baseline = set(&[("gone.proto", b"g"), ("mod.proto", b"v1")]);
        let mut changes = diff_file_sets(&current, &baseline);
        changes.sort_by(|a, b| b.class.cmp(&a.class));
        assert_eq!(changes[0].class, ChangeClass::Breaking);
        assert_eq!(changes[2].class, ChangeClass::Fix);
    }
}

use crate::error::{Result, SandboxError};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod mask;
pub mod structure;
pub mod target;

pub use mask::{mask, overlay, StageMask};
pub use structure::{lockstep_pairs, TargetCollection, TargetStruct};
pub use target::{LocalTarget, Target, TargetKind};

/// Targets of one staging direction together with their staged copies
#[derive(Debug, Clone)]
pub struct StageInfo {
    pub targets: TargetStruct,
    /// Directory below the executor's temporary staging directory
    pub stage_dir: PathBuf,
    pub staged_targets: TargetStruct,
}

impl fmt::Display for StageInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "StageInfo:")?;
        writeln!(f, "  targets       : {} leaves", self.targets.leaves().len())?;
        writeln!(f, "  stage_dir     : {}", self.stage_dir.display())?;
        write!(f, "  staged_targets: {} leaves", self.staged_targets.leaves().len())
    }
}

/// Outcome of a best-effort stage-out
#[derive(Debug, Clone, Default)]
pub struct StageOutReport {
    pub copied: usize,
    /// Staged locations the sandboxed process did not produce
    pub missing: Vec<PathBuf>,
}

/// Relocate every leaf of `structure` to `stage_dir/<unique basename>`.
///
/// Only the structure is created, no content is copied.
pub fn stage(structure: &TargetStruct, stage_dir: &Path) -> Result<TargetStruct> {
    let mut seen: HashMap<String, PathBuf> = HashMap::new();
    structure.try_map_leaves(&mut |target: &Arc<dyn Target>| {
        let name = target.unique_basename();
        match seen.get(&name) {
            Some(first) if first != target.path() => {
                return Err(SandboxError::NamingCollision {
                    name,
                    first: first.clone(),
                    second: target.path().to_path_buf(),
                });
            }
            Some(_) => {}
            None => {
                seen.insert(name.clone(), target.path().to_path_buf());
            }
        }
        Ok(target.relocate(stage_dir.join(name)))
    })
}

/// Copy every original leaf to its staged counterpart, returning the number of copies
pub fn copy_in(original: &TargetStruct, staged: &TargetStruct) -> Result<usize> {
    let pairs = lockstep_pairs(original, staged)?;
    for (src, dst) in &pairs {
        crate::log_stage_in!(src.path(), dst.path());
        src.copy_to_local(dst.path())?;
    }
    Ok(pairs.len())
}

/// Copy staged leaves back to their original locations.
///
/// A staged leaf that does not exist is recorded and logged as a warning.
pub fn copy_out(staged: &TargetStruct, original: &TargetStruct) -> Result<StageOutReport> {
    let mut report = StageOutReport::default();
    for (src, dst) in lockstep_pairs(staged, original)? {
        if !src.exists() {
            tracing::warn!(
                path = %src.path().display(),
                "could not find output target for stage-out"
            );
            report.missing.push(src.path().to_path_buf());
            continue;
        }
        crate::log_stage_out!(src.path(), dst.path());
        dst.copy_from_local(src.path())?;
        report.copied += 1;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_detects_collisions() {
        #[derive(Debug)]
        struct FixedName(PathBuf);

        impl Target for FixedName {
            fn path(&self) -> &Path {
                &self.0
            }
            fn kind(&self) -> TargetKind {
                TargetKind::File
            }
            fn exists(&self) -> bool {
                false
            }
            fn copy_to_local(&self, _dst: &Path) -> anyhow::Result<()> {
                Ok(())
            }
            fn copy_from_local(&self, _src: &Path) -> anyhow::Result<()> {
                Ok(())
            }
            fn relocate(&self, path: PathBuf) -> Arc<dyn Target> {
                Arc::new(FixedName(path))
            }
            fn unique_basename(&self) -> String {
                "same".to_string()
            }
        }

        let s = TargetStruct::sequence([
            TargetStruct::leaf(FixedName("/a/x".into())),
            TargetStruct::leaf(FixedName("/b/x".into())),
        ]);
        let err = stage(&s, Path::new("/stage")).unwrap_err();
        assert!(matches!(err, SandboxError::NamingCollision { .. }));

        let repeated = TargetStruct::sequence([
            TargetStruct::leaf(FixedName("/a/x".into())),
            TargetStruct::leaf(FixedName("/a/x".into())),
        ]);
        assert!(stage(&repeated, Path::new("/stage")).is_ok());
    }

    #[test]
    fn test_stage_info_display() {
        let info = StageInfo {
            targets: TargetStruct::file("/a"),
            stage_dir: PathBuf::from("/tmp/stagein"),
            staged_targets: TargetStruct::file("/tmp/stagein/x_a"),
        };
        assert!(info.to_string().contains("/tmp/stagein"));
    }
}

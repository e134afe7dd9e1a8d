use crate::constants::UNIQUE_BASENAME_HASH_LEN;
use anyhow::{Context, Result};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    File,
    Directory,
}

/// A file-like artifact provided by a storage layer
pub trait Target: Send + Sync + fmt::Debug {
    fn path(&self) -> &Path;

    fn kind(&self) -> TargetKind;

    fn exists(&self) -> bool;

    /// Copy this target's content to the local path `dst`
    fn copy_to_local(&self, dst: &Path) -> Result<()>;

    /// Replace this target's content with the content at the local path `src`
    fn copy_from_local(&self, src: &Path) -> Result<()>;

    /// A target of the same kind located at `path`
    fn relocate(&self, path: PathBuf) -> Arc<dyn Target>;

    /// File name prefixed with a hash of the full path, so equally named
    /// targets from different directories do not collide when staged
    fn unique_basename(&self) -> String {
        let path = self.path();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "target".to_string());
        let hash = blake3::hash(path.to_string_lossy().as_bytes()).to_hex();
        format!("{}_{}", &hash[..UNIQUE_BASENAME_HASH_LEN], name)
    }
}

/// Target on the local filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTarget {
    path: PathBuf,
    kind: TargetKind,
}

impl LocalTarget {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: TargetKind::File,
        }
    }

    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: TargetKind::Directory,
        }
    }
}

impl Target for LocalTarget {
    fn path(&self) -> &Path {
        &self.path
    }

    fn kind(&self) -> TargetKind {
        self.kind
    }

    fn exists(&self) -> bool {
        match self.kind {
            TargetKind::File => self.path.is_file(),
            TargetKind::Directory => self.path.is_dir(),
        }
    }

    fn copy_to_local(&self, dst: &Path) -> Result<()> {
        copy_path(&self.path, dst, self.kind)
    }

    fn copy_from_local(&self, src: &Path) -> Result<()> {
        copy_path(src, &self.path, self.kind)
    }

    fn relocate(&self, path: PathBuf) -> Arc<dyn Target> {
        Arc::new(Self {
            path,
            kind: self.kind,
        })
    }
}

fn copy_path(src: &Path, dst: &Path, kind: TargetKind) -> Result<()> {
    match kind {
        TargetKind::File => {
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(src, dst)
                .with_context(|| format!("failed to copy {} to {}", src.display(), dst.display()))?;
        }
        TargetKind::Directory => {
            for entry in WalkDir::new(src).follow_links(true) {
                let entry = entry?;
                let rel = entry.path().strip_prefix(src)?;
                let target = dst.join(rel);
                if entry.file_type().is_dir() {
                    fs::create_dir_all(&target)?;
                } else {
                    fs::copy(entry.path(), &target).with_context(|| {
                        format!(
                            "failed to copy {} to {}",
                            entry.path().display(),
                            target.display()
                        )
                    })?;
                }
            }
        }
    }
    Ok(())
}

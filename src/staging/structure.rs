use super::target::{LocalTarget, Target};
use crate::error::{Result, SandboxError};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

/// Nested arrangement of targets as returned by a task's inputs or outputs
#[derive(Debug, Clone)]
pub enum TargetStruct {
    Leaf(Arc<dyn Target>),
    Mapping(BTreeMap<String, TargetStruct>),
    Sequence(Vec<TargetStruct>),
    Collection(TargetCollection),
}

/// A group of targets handled as one unit by the task, but staged leaf by leaf
#[derive(Debug, Clone)]
pub struct TargetCollection {
    targets: Box<TargetStruct>,
}

impl TargetCollection {
    pub fn new(targets: TargetStruct) -> Self {
        Self {
            targets: Box::new(targets),
        }
    }

    pub fn targets(&self) -> &TargetStruct {
        &self.targets
    }

    /// Every leaf of the collection in traversal order
    pub fn flat_targets(&self) -> Vec<Arc<dyn Target>> {
        self.targets.leaves()
    }

    pub fn len(&self) -> usize {
        self.flat_targets().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TargetStruct {
    pub fn leaf(target: impl Target + 'static) -> Self {
        Self::Leaf(Arc::new(target))
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::leaf(LocalTarget::file(path))
    }

    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Self::leaf(LocalTarget::directory(path))
    }

    pub fn mapping<K: Into<String>>(entries: impl IntoIterator<Item = (K, TargetStruct)>) -> Self {
        Self::Mapping(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn sequence(items: impl IntoIterator<Item = TargetStruct>) -> Self {
        Self::Sequence(items.into_iter().collect())
    }

    pub fn collection(targets: TargetStruct) -> Self {
        Self::Collection(TargetCollection::new(targets))
    }

    pub fn empty() -> Self {
        Self::Sequence(Vec::new())
    }

    /// True when the structure holds no leaf at all
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Leaf(_) => false,
            Self::Mapping(m) => m.values().all(TargetStruct::is_empty),
            Self::Sequence(s) => s.iter().all(TargetStruct::is_empty),
            Self::Collection(c) => c.is_empty(),
        }
    }

    /// Leaves and collections in order, without descending into collections
    pub fn flatten(&self) -> Vec<TargetStruct> {
        let mut out = Vec::new();
        self.flatten_into(&mut out);
        out
    }

    fn flatten_into(&self, out: &mut Vec<TargetStruct>) {
        match self {
            Self::Leaf(_) | Self::Collection(_) => out.push(self.clone()),
            Self::Mapping(m) => m.values().for_each(|v| v.flatten_into(out)),
            Self::Sequence(s) => s.iter().for_each(|v| v.flatten_into(out)),
        }
    }

    /// All leaf targets, including those inside collections
    pub fn leaves(&self) -> Vec<Arc<dyn Target>> {
        match self {
            Self::Leaf(t) => vec![t.clone()],
            Self::Mapping(m) => m.values().flat_map(TargetStruct::leaves).collect(),
            Self::Sequence(s) => s.iter().flat_map(TargetStruct::leaves).collect(),
            Self::Collection(c) => c.flat_targets(),
        }
    }

    /// Same structure with every leaf replaced by `f(leaf)`
    pub fn try_map_leaves<F>(&self, f: &mut F) -> Result<TargetStruct>
    where
        F: FnMut(&Arc<dyn Target>) -> Result<Arc<dyn Target>>,
    {
        Ok(match self {
            Self::Leaf(t) => Self::Leaf(f(t)?),
            Self::Mapping(m) => Self::Mapping(
                m.iter()
                    .map(|(k, v)| Ok((k.clone(), v.try_map_leaves(f)?)))
                    .collect::<Result<_>>()?,
            ),
            Self::Sequence(s) => Self::Sequence(
                s.iter()
                    .map(|v| v.try_map_leaves(f))
                    .collect::<Result<_>>()?,
            ),
            Self::Collection(c) => Self::Collection(TargetCollection::new(c.targets.try_map_leaves(f)?)),
        })
    }

    /// Same nesting, same keys and same collection lengths
    pub fn same_shape(&self, other: &TargetStruct) -> bool {
        match (self, other) {
            (Self::Leaf(_), Self::Leaf(_)) => true,
            (Self::Mapping(a), Self::Mapping(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|((ka, va), (kb, vb))| ka == kb && va.same_shape(vb))
            }
            (Self::Sequence(a), Self::Sequence(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.same_shape(y))
            }
            (Self::Collection(a), Self::Collection(b)) => a.targets.same_shape(&b.targets),
            _ => false,
        }
    }
}

/// Pair up the leaves of two equally shaped structures.
///
/// Both are flattened without descending into collections; when a collection
/// comes up, its flat targets are spliced in front of the remaining queue.
pub fn lockstep_pairs(
    a: &TargetStruct,
    b: &TargetStruct,
) -> Result<Vec<(Arc<dyn Target>, Arc<dyn Target>)>> {
    let mut queue_a: VecDeque<TargetStruct> = a.flatten().into();
    let mut queue_b: VecDeque<TargetStruct> = b.flatten().into();
    let mut pairs = Vec::new();

    while let Some(item_a) = queue_a.pop_front() {
        let item_b = queue_b
            .pop_front()
            .ok_or_else(|| shape_mismatch("second structure has fewer leaves"))?;

        match (item_a, item_b) {
            (TargetStruct::Collection(ca), TargetStruct::Collection(cb)) => {
                for t in ca.flat_targets().into_iter().rev() {
                    queue_a.push_front(TargetStruct::Leaf(t));
                }
                for t in cb.flat_targets().into_iter().rev() {
                    queue_b.push_front(TargetStruct::Leaf(t));
                }
            }
            (TargetStruct::Leaf(ta), TargetStruct::Leaf(tb)) => pairs.push((ta, tb)),
            _ => return Err(shape_mismatch("collection paired with a plain target")),
        }
    }

    if !queue_b.is_empty() {
        return Err(shape_mismatch("second structure has more leaves"));
    }
    Ok(pairs)
}

fn shape_mismatch(reason: &str) -> SandboxError {
    SandboxError::Other(anyhow::anyhow!("target structures differ in shape: {}", reason))
}

use super::structure::{TargetCollection, TargetStruct};
use glob::Pattern;

/// Selects the parts of a target structure that take part in staging
#[derive(Debug, Clone, PartialEq, Default)]
pub enum StageMask {
    /// Stage the whole structure
    All,
    /// Stage nothing
    #[default]
    Nothing,
    /// For mappings: glob pattern on the key, with a mask for the matched value.
    /// The first matching pattern applies.
    Keys(Vec<(String, StageMask)>),
    /// For sequences: mask per position, missing positions are not staged
    Indices(Vec<StageMask>),
}

impl StageMask {
    /// Stage the complete values of all keys matching one of `patterns`
    pub fn keys<S: Into<String>>(patterns: impl IntoIterator<Item = S>) -> Self {
        Self::Keys(
            patterns
                .into_iter()
                .map(|p| (p.into(), StageMask::All))
                .collect(),
        )
    }

    /// True when the mask can never select anything
    pub fn is_empty(&self) -> bool {
        match self {
            Self::All => false,
            Self::Nothing => true,
            Self::Keys(k) => k.iter().all(|(_, m)| m.is_empty()),
            Self::Indices(i) => i.iter().all(StageMask::is_empty),
        }
    }

    fn for_key(&self, key: &str) -> Option<&StageMask> {
        match self {
            Self::Keys(patterns) => patterns
                .iter()
                .find(|(p, _)| Pattern::new(p).map(|p| p.matches(key)).unwrap_or(p == key))
                .map(|(_, m)| m),
            _ => None,
        }
    }
}

/// Prune `structure` to the parts selected by `pattern`.
///
/// `None` means nothing is left, i.e. no staging is requested.
pub fn mask(pattern: &StageMask, structure: &TargetStruct) -> Option<TargetStruct> {
    let masked = match (pattern, structure) {
        (StageMask::Nothing, _) => None,
        (StageMask::All, s) => Some(s.clone()),
        (StageMask::Keys(_), TargetStruct::Mapping(map)) => Some(TargetStruct::Mapping(
            map.iter()
                .filter_map(|(k, v)| {
                    let sub = pattern.for_key(k)?;
                    mask(sub, v).map(|m| (k.clone(), m))
                })
                .collect(),
        )),
        (StageMask::Indices(masks), TargetStruct::Sequence(items)) => Some(TargetStruct::Sequence(
            items
                .iter()
                .zip(masks.iter())
                .filter_map(|(item, sub)| mask(sub, item))
                .collect(),
        )),
        (StageMask::Keys(_) | StageMask::Indices(_), TargetStruct::Collection(c)) => {
            mask(pattern, c.targets()).map(|t| TargetStruct::Collection(TargetCollection::new(t)))
        }
        _ => None,
    };
    masked.filter(|m| !m.is_empty())
}

/// Take the parts selected by `pattern` from `staged` and everything else from
/// `original`. Both must have the same shape.
pub fn overlay(pattern: &StageMask, staged: &TargetStruct, original: &TargetStruct) -> TargetStruct {
    match (pattern, staged, original) {
        (StageMask::Nothing, _, o) => o.clone(),
        (StageMask::All, s, _) => s.clone(),
        (StageMask::Keys(_), TargetStruct::Mapping(s), TargetStruct::Mapping(o)) => {
            TargetStruct::Mapping(
                o.iter()
                    .map(|(k, ov)| {
                        let merged = match (pattern.for_key(k), s.get(k)) {
                            (Some(sub), Some(sv)) => overlay(sub, sv, ov),
                            _ => ov.clone(),
                        };
                        (k.clone(), merged)
                    })
                    .collect(),
            )
        }
        (StageMask::Indices(masks), TargetStruct::Sequence(s), TargetStruct::Sequence(o)) => {
            TargetStruct::Sequence(
                o.iter()
                    .enumerate()
                    .map(|(i, ov)| match (masks.get(i), s.get(i)) {
                        (Some(sub), Some(sv)) => overlay(sub, sv, ov),
                        _ => ov.clone(),
                    })
                    .collect(),
            )
        }
        (
            StageMask::Keys(_) | StageMask::Indices(_),
            TargetStruct::Collection(s),
            TargetStruct::Collection(o),
        ) => TargetStruct::Collection(TargetCollection::new(overlay(
            pattern,
            s.targets(),
            o.targets(),
        ))),
        (_, _, o) => o.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outputs() -> TargetStruct {
        TargetStruct::mapping([
            ("histograms", TargetStruct::file("/out/hists.root")),
            ("plots", TargetStruct::collection(TargetStruct::sequence([
                TargetStruct::file("/out/a.pdf"),
                TargetStruct::file("/out/b.pdf"),
            ]))),
            ("log", TargetStruct::file("/out/log.txt")),
        ])
    }

    #[test]
    fn test_mask_nothing_and_empty_matches() {
        assert!(mask(&StageMask::Nothing, &outputs()).is_none());
        assert!(mask(&StageMask::keys(["does_not_exist"]), &outputs()).is_none());
        assert!(mask(&StageMask::All, &TargetStruct::empty()).is_none());
        assert!(StageMask::keys(Vec::<String>::new()).is_empty());
    }

    #[test]
    fn test_mask_by_key_patterns() {
        let masked = mask(&StageMask::keys(["hist*", "plots"]), &outputs()).unwrap();
        match &masked {
            TargetStruct::Mapping(m) => {
                assert_eq!(m.keys().collect::<Vec<_>>(), vec!["histograms", "plots"]);
            }
            other => panic!("expected mapping, got {:?}", other),
        }
        assert_eq!(masked.leaves().len(), 3);
    }

    #[test]
    fn test_mask_indices() {
        let seq = TargetStruct::sequence([
            TargetStruct::file("/a"),
            TargetStruct::file("/b"),
            TargetStruct::file("/c"),
        ]);
        let masked = mask(
            &StageMask::Indices(vec![StageMask::Nothing, StageMask::All]),
            &seq,
        )
        .unwrap();
        let leaves = masked.leaves();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].path(), std::path::Path::new("/b"));
    }

    #[test]
    fn test_overlay_mixes_staged_and_original() {
        let original = outputs();
        let staged = original
            .try_map_leaves(&mut |t: &std::sync::Arc<dyn crate::staging::Target>| {
                Ok(t.relocate(std::path::Path::new("/stage").join(t.unique_basename())))
            })
            .unwrap();

        let view = overlay(&StageMask::keys(["log"]), &staged, &original);
        assert!(view.same_shape(&original));
        match &view {
            TargetStruct::Mapping(m) => {
                assert!(m["log"].leaves()[0].path().starts_with("/stage"));
                assert!(m["histograms"].leaves()[0].path().starts_with("/out"));
            }
            other => panic!("expected mapping, got {:?}", other),
        }
    }
}

/// Staging of nested target structures on the local filesystem
#[cfg(test)]
mod staging_tests {
    use sandtask::staging::{copy_in, copy_out, mask, stage, StageMask, TargetStruct};
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_mapping_with_collection_and_sequence_copies_five_leaves() {
        let src = tempdir().unwrap();
        let stage_dir = tempdir().unwrap();

        let calib: Vec<_> = (0..3).map(|i| src.path().join(format!("calib/c{}.txt", i))).collect();
        let data: Vec<_> = (0..2).map(|i| src.path().join(format!("data/d{}.txt", i))).collect();
        for path in calib.iter().chain(data.iter()) {
            write(path, &path.display().to_string());
        }

        let inputs = TargetStruct::mapping([
            (
                "calib",
                TargetStruct::collection(TargetStruct::sequence(calib.iter().map(TargetStruct::file))),
            ),
            ("data", TargetStruct::sequence(data.iter().map(TargetStruct::file))),
        ]);

        let staged = stage(&inputs, stage_dir.path()).unwrap();
        assert!(staged.same_shape(&inputs));
        assert_eq!(copy_in(&inputs, &staged).unwrap(), 5);
        assert_eq!(fs::read_dir(stage_dir.path()).unwrap().count(), 5);
    }

    #[test]
    fn test_round_trip_preserves_bytes_and_shape() {
        let src = tempdir().unwrap();
        let stage_dir = tempdir().unwrap();
        let dst = tempdir().unwrap();

        write(&src.path().join("a.txt"), "alpha");
        write(&src.path().join("tree/inner/b.txt"), "beta");

        let original = TargetStruct::mapping([
            ("file", TargetStruct::file(src.path().join("a.txt"))),
            ("dir", TargetStruct::directory(src.path().join("tree"))),
        ]);
        let staged = stage(&original, stage_dir.path()).unwrap();
        copy_in(&original, &staged).unwrap();

        let restored = TargetStruct::mapping([
            ("file", TargetStruct::file(dst.path().join("a.txt"))),
            ("dir", TargetStruct::directory(dst.path().join("tree"))),
        ]);
        let report = copy_out(&staged, &restored).unwrap();

        assert_eq!(report.copied, 2);
        assert!(report.missing.is_empty());
        assert!(restored.same_shape(&original));
        assert_eq!(fs::read_to_string(dst.path().join("a.txt")).unwrap(), "alpha");
        assert_eq!(
            fs::read_to_string(dst.path().join("tree/inner/b.txt")).unwrap(),
            "beta"
        );
    }

    #[test]
    fn test_mask_matching_nothing_requests_no_staging() {
        let outputs = TargetStruct::mapping([("plot", TargetStruct::file("/out/plot.pdf"))]);

        assert!(mask(&StageMask::keys(["histograms*"]), &outputs).is_none());
        assert!(mask(&StageMask::Nothing, &outputs).is_none());
        assert!(mask(&StageMask::All, &outputs).is_some());
    }

    #[test]
    fn test_missing_stage_out_leaf_is_reported_not_fatal() {
        let stage_dir = tempdir().unwrap();
        let out = tempdir().unwrap();

        let original = TargetStruct::sequence([
            TargetStruct::file(out.path().join("made.txt")),
            TargetStruct::file(out.path().join("missing.txt")),
        ]);
        let staged = stage(&original, stage_dir.path()).unwrap();
        let made = &staged.leaves()[0];
        write(made.path(), "done");

        let report = copy_out(&staged, &original).unwrap();
        assert_eq!(report.copied, 1);
        assert_eq!(report.missing, vec![staged.leaves()[1].path().to_path_buf()]);
        assert_eq!(fs::read_to_string(out.path().join("made.txt")).unwrap(), "done");
        assert!(!out.path().join("missing.txt").exists());
    }
}

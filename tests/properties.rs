/// Property tests for identification and automatic expansion

mod common;

use a2nest::*;
use common::*;
use proptest::prelude::*;

const EXTENSIONS: &[&str] = &["", "po", "dsk", "2mg", "zip", "gz", "shk", "hdv", "txt"];

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_identify_arbitrary_bytes(
        data in proptest::collection::vec(any::<u8>(), 0..2048),
        ext in proptest::sample::select(EXTENSIONS),
    ) {
        // either answer is fine, as long as nothing panics
        let _ = identify(SharedStream::from_bytes(data), ext);
    }

    #[test]
    fn prop_truncated_archive_never_panics(cut in 0usize..4096) {
        let stream = zip_with(vec![
            NewEntry::file("disk.po", prodos_bytes("CUT")),
            NewEntry::file("notes.txt", b"some notes".to_vec()),
        ]);
        let mut data = stream.read_all().unwrap();
        let keep = data.len().saturating_sub(cut);
        data.truncate(keep);

        let mut tree = ContainerTree::default();
        if tree.open_stream(SharedStream::from_bytes(data), "cut.zip").is_ok() {
            prop_assert!(tree.node_count() <= 3);
        } else {
            prop_assert_eq!(tree.node_count(), 0);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn prop_depth_policies_are_monotonic(disks in 0usize..3, files in 0usize..3) {
        let mut entries = Vec::new();
        for i in 0..disks {
            entries.push(NewEntry::file(format!("d{}.po", i), prodos_bytes(&format!("VOL{}", i))));
        }
        for i in 0..files {
            entries.push(NewEntry::file(format!("f{}.txt", i), vec![b'x'; 10 + i]));
        }
        let data = zip_with(entries).read_all().unwrap();

        let mut sizes = Vec::new();
        for depth in [DepthPolicy::Shallow, DepthPolicy::SubVolume, DepthPolicy::Max] {
            let mut tree = ContainerTree::new(ScanOptions::with_depth(depth));
            tree.open_stream(SharedStream::from_bytes(data.clone()), "set.zip").unwrap();
            sizes.push((tree.node_count(), tree.depth()));
        }
        prop_assert!(sizes[0].0 <= sizes[1].0 && sizes[1].0 <= sizes[2].0);
        prop_assert!(sizes[0].1 <= sizes[1].1 && sizes[1].1 <= sizes[2].1);
        prop_assert_eq!(sizes[2].0, 1 + 2 * disks);
    }

    #[test]
    fn prop_self_nesting_terminates(levels in 1usize..24) {
        // a gzip of a gzip of ... a disk image
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut data = prodos_bytes("CORE");
        for _ in 0..levels {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
            encoder.write_all(&data).unwrap();
            data = encoder.finish().unwrap();
        }

        let mut tree = ContainerTree::default();
        tree.open_stream(SharedStream::from_bytes(data), "deep.gz").unwrap();
        prop_assert!(tree.depth() <= a2nest::tree::MAX_NESTING_DEPTH + 1);
        prop_assert!(tree.node_count() >= 1);
    }
}

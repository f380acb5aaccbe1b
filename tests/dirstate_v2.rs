//! End-to-end tests driving the docket, the data file and the status
//! walk through real files in a temporary repository.

use hg_dirstate::dirstate::docket::read_docket;
use hg_dirstate::dirstate::status::{
    status, IgnoreConfig, IgnorePatternsHasher, StatusOptions,
};
use hg_dirstate::repo::Repo;
use hg_dirstate::utils::hg_path::HgPath;
use hg_dirstate::{
    DirectoryCache, DirstateEntry, DirstateError, DirstateMap,
    DirstateParents, DirstateV2Data, NodeId, TruncatedTimestamp,
};
use pretty_assertions::assert_eq;
use std::fs;
use std::path::Path;

fn tracked_entry() -> DirstateEntry {
    DirstateEntry::from_v2_data(DirstateV2Data {
        wc_tracked: true,
        ..Default::default()
    })
}

fn clean_entry(size: u32, seconds: u32, nanoseconds: u32) -> DirstateEntry {
    DirstateEntry::from_v2_data(DirstateV2Data {
        wc_tracked: true,
        p1_tracked: true,
        mode_size: Some((0o644, size)),
        mtime: Some(
            TruncatedTimestamp::from_already_truncated(
                seconds,
                nanoseconds,
                false,
            )
            .unwrap(),
        ),
        ..Default::default()
    })
}

fn entries_of(map: &DirstateMap) -> Vec<(String, DirstateV2Data)> {
    map.iter()
        .map(|item| {
            let (path, entry) = item.unwrap();
            (path.to_string(), entry.v2_data())
        })
        .collect()
}

fn be32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes(bytes.try_into().unwrap())
}

#[test]
fn test_empty_init_roundtrip() -> Result<(), DirstateError> {
    let tmp = tempfile::tempdir().unwrap();
    let repo = Repo::init(tmp.path())?;
    let mut map = repo.open_dirstate_map()?;
    repo.write_dirstate(&mut map, DirstateParents::NULL)?;

    let docket_bytes = fs::read(tmp.path().join(".hg/dirstate")).unwrap();
    // 125-byte header plus an 8-hex-digit identifier
    assert_eq!(docket_bytes.len(), 125 + 8);
    assert_eq!(&docket_bytes[0..12], b"dirstate-v2\n");
    // Null parents
    assert_eq!(docket_bytes[12..76], [0; 64]);
    // Root pointer and count
    assert_eq!(be32(&docket_bytes[76..80]), 0);
    assert_eq!(be32(&docket_bytes[80..84]), 0);
    // Entry, copy source and unreachable counters
    assert_eq!(be32(&docket_bytes[84..88]), 0);
    assert_eq!(be32(&docket_bytes[88..92]), 0);
    assert_eq!(be32(&docket_bytes[92..96]), 0);
    // Reserved bytes and absent ignore hash
    assert_eq!(docket_bytes[96..120], [0; 24]);
    // Nothing used in the data file
    assert_eq!(be32(&docket_bytes[120..124]), 0);
    assert_eq!(docket_bytes[124], 8);

    let reopened = Repo::open(tmp.path())?;
    assert_eq!(reopened.dirstate_parents()?, DirstateParents::NULL);
    let map = reopened.open_dirstate_map()?;
    assert_eq!(map.get_map().len(), 0);
    Ok(())
}

#[test]
fn test_single_add_exact_bytes() -> Result<(), DirstateError> {
    let tmp = tempfile::tempdir().unwrap();
    let repo = Repo::init(tmp.path())?;
    let mut map = repo.open_dirstate_map()?;
    map.with_dmap_mut(|dmap| {
        dmap.set_entry(
            HgPath::new(b"foo"),
            clean_entry(3, 1_000_000, 500),
        )
    })?;
    let parents = DirstateParents {
        p1: NodeId::from_hex_prefix(b"12abcdef").unwrap(),
        p2: NodeId::NULL,
    };
    repo.write_dirstate(&mut map, parents)?;

    let docket_bytes = fs::read(tmp.path().join(".hg/dirstate")).unwrap();
    let docket = read_docket(&docket_bytes)?;
    assert_eq!(docket.parents(), parents);
    // Parent 1 is left-aligned and zero-padded
    assert_eq!(docket_bytes[12..16], [0x12, 0xab, 0xcd, 0xef]);
    assert_eq!(docket_bytes[16..44], [0; 28]);
    assert_eq!(docket.tree_metadata().node_count(), 1);
    assert_eq!(docket.tree_metadata().copy_source_count(), 0);

    // The data file holds the path bytes then one node record
    let data =
        fs::read(tmp.path().join(".hg").join(docket.data_filename()))
            .unwrap();
    assert_eq!(data.len(), 3 + 44);
    assert_eq!(docket.data_size(), data.len());
    assert_eq!(&data[0..3], b"foo");
    // Root pointer and count in the docket
    assert_eq!(be32(&docket_bytes[76..80]), 3);
    assert_eq!(be32(&docket_bytes[80..84]), 1);
    // full path (start, len) and base name start
    assert_eq!(be32(&data[3..7]), 0);
    assert_eq!(u16::from_be_bytes(data[7..9].try_into().unwrap()), 3);
    assert_eq!(u16::from_be_bytes(data[9..11].try_into().unwrap()), 0);
    // no copy source
    assert_eq!(be32(&data[11..15]), 0);
    // flags: WDIR_TRACKED | P1_TRACKED | HAS_MODE_AND_SIZE | HAS_MTIME
    let flags = u16::from_be_bytes(data[33..35].try_into().unwrap());
    assert_eq!(flags, 1 | 2 | (1 << 10) | (1 << 11));
    // size, mtime seconds, mtime nanoseconds
    assert_eq!(be32(&data[35..39]), 3);
    assert_eq!(be32(&data[39..43]), 1_000_000);
    assert_eq!(be32(&data[43..47]), 500);

    // Round-trip through a fresh mmap
    let reopened = Repo::open(tmp.path())?;
    let map = reopened.open_dirstate_map()?;
    let entries = entries_of(map.get_map());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, "foo");
    let data = &entries[0].1;
    assert!(data.wc_tracked && data.p1_tracked && !data.p2_info);
    assert_eq!(data.mode_size, Some((0o644, 3)));
    let mtime = data.mtime.unwrap();
    assert_eq!(
        (mtime.truncated_seconds(), mtime.nanoseconds()),
        (1_000_000, 500)
    );
    Ok(())
}

#[test]
fn test_siblings_sorted_and_counted() -> Result<(), DirstateError> {
    let tmp = tempfile::tempdir().unwrap();
    let repo = Repo::init(tmp.path())?;
    let mut map = repo.open_dirstate_map()?;
    map.with_dmap_mut(|dmap| {
        // Inserted out of order on purpose
        dmap.set_entry(HgPath::new(b"a/y"), tracked_entry())?;
        dmap.set_entry(HgPath::new(b"a/x"), tracked_entry())
    })?;
    repo.write_dirstate(&mut map, DirstateParents::NULL)?;

    let docket_bytes = fs::read(tmp.path().join(".hg/dirstate")).unwrap();
    let docket = read_docket(&docket_bytes)?;
    assert_eq!(docket.tree_metadata().node_count(), 2);
    // The root has a single child ("a")
    assert_eq!(be32(&docket_bytes[80..84]), 1);

    let reopened = Repo::open(tmp.path())?;
    let map = reopened.open_dirstate_map()?;
    let dmap = map.get_map();
    // Stored sibling order is the sorted order
    let paths: Vec<String> =
        entries_of(dmap).into_iter().map(|(path, _)| path).collect();
    assert_eq!(paths, ["a/x", "a/y"]);
    assert!(dmap.has_tracked_dir(HgPath::new(b"a"))?);
    // Point lookups, hits and misses
    assert!(dmap.get(HgPath::new(b"a/x"))?.is_some());
    assert!(dmap.get(HgPath::new(b"a/y"))?.is_some());
    assert!(dmap.get(HgPath::new(b"a"))?.is_none());
    assert!(dmap.get(HgPath::new(b"a/z"))?.is_none());
    assert!(dmap.get(HgPath::new(b"a/x/y"))?.is_none());
    assert!(dmap.get(HgPath::new(b"b"))?.is_none());
    Ok(())
}

#[test]
fn test_copy_source_roundtrip() -> Result<(), DirstateError> {
    let tmp = tempfile::tempdir().unwrap();
    let repo = Repo::init(tmp.path())?;
    let mut map = repo.open_dirstate_map()?;
    map.with_dmap_mut(|dmap| {
        dmap.set_entry(HgPath::new(b"b"), tracked_entry())?;
        dmap.copy_map_insert(HgPath::new(b"b"), HgPath::new(b"a").into())
    })?;
    repo.write_dirstate(&mut map, DirstateParents::NULL)?;

    let docket_bytes = fs::read(tmp.path().join(".hg/dirstate")).unwrap();
    assert_eq!(read_docket(&docket_bytes)?.tree_metadata().copy_source_count(), 1);

    let reopened = Repo::open(tmp.path())?;
    let map = reopened.open_dirstate_map()?;
    assert_eq!(
        map.get_map().copy_map_get(HgPath::new(b"b"))?,
        Some(HgPath::new(b"a"))
    );
    Ok(())
}

#[test]
fn test_append_idempotence_and_unreachable_monotonicity(
) -> Result<(), DirstateError> {
    let tmp = tempfile::tempdir().unwrap();
    let repo = Repo::init(tmp.path())?;
    let mut map = repo.open_dirstate_map()?;
    map.with_dmap_mut(|dmap| {
        for name in ["big/a", "big/b", "big/c", "big/d", "foo"] {
            dmap.set_entry(HgPath::new(name), tracked_entry())?;
        }
        Ok::<_, DirstateError>(())
    })?;
    repo.write_dirstate(&mut map, DirstateParents::NULL)?;
    let docket_1 = fs::read(tmp.path().join(".hg/dirstate")).unwrap();

    // Committing with an empty overlay appends nothing and leaves the
    // docket byte-identical.
    let mut map = repo.open_dirstate_map()?;
    repo.write_dirstate(&mut map, DirstateParents::NULL)?;
    let docket_2 = fs::read(tmp.path().join(".hg/dirstate")).unwrap();
    assert_eq!(docket_1, docket_2);

    // Touching one entry appends: same generation, more used bytes, and
    // a larger unreachable estimate.
    let mut map = repo.open_dirstate_map()?;
    map.with_dmap_mut(|dmap| {
        dmap.set_entry(HgPath::new(b"foo"), clean_entry(7, 1234, 0))
    })?;
    repo.write_dirstate(&mut map, DirstateParents::NULL)?;
    let docket_3 = fs::read(tmp.path().join(".hg/dirstate")).unwrap();
    let before = read_docket(&docket_1)?;
    let after = read_docket(&docket_3)?;
    assert_eq!(before.uuid, after.uuid);
    assert!(after.data_size() > before.data_size());
    assert!(
        after.tree_metadata().unreachable_bytes()
            > before.tree_metadata().unreachable_bytes()
    );
    // The untouched subtree was not rewritten: the appended bytes are
    // the replaced root run and the new "foo" node, not 5 nodes worth.
    assert!(after.data_size() < before.data_size() + 5 * 44);
    Ok(())
}

#[test]
fn test_rewrite_trigger() -> Result<(), DirstateError> {
    let tmp = tempfile::tempdir().unwrap();
    let repo = Repo::init(tmp.path())?;
    let mut map = repo.open_dirstate_map()?;
    map.with_dmap_mut(|dmap| {
        for i in 0..20 {
            let path = format!("big/{:02}", i);
            dmap.set_entry(HgPath::new(path.as_bytes()), tracked_entry())?;
        }
        dmap.set_entry(HgPath::new(b"foo"), tracked_entry())
    })?;
    repo.write_dirstate(&mut map, DirstateParents::NULL)?;
    let first_docket_bytes =
        fs::read(tmp.path().join(".hg/dirstate")).unwrap();
    let first_docket = read_docket(&first_docket_bytes)?;
    let first_uuid = first_docket.uuid.to_vec();
    let first_data_file = first_docket.data_filename();

    // Each commit strands the old root run; once more than half of the
    // data file is unreachable, the writer must switch to a fresh
    // generation.
    let mut rewrote = false;
    for i in 0..50 {
        let mut map = repo.open_dirstate_map()?;
        map.with_dmap_mut(|dmap| {
            dmap.set_entry(HgPath::new(b"foo"), clean_entry(1, 1000 + i, 0))
        })?;
        repo.write_dirstate(&mut map, DirstateParents::NULL)?;

        let docket_bytes =
            fs::read(tmp.path().join(".hg/dirstate")).unwrap();
        let docket = read_docket(&docket_bytes)?;
        let meta = docket.tree_metadata();
        if docket.uuid != first_uuid {
            // Fresh generation: reachable bytes only, old file gone
            assert_eq!(meta.unreachable_bytes(), 0);
            assert!(!tmp.path().join(".hg").join(&first_data_file).exists());
            rewrote = true;
            break;
        }
        // While appending, the estimate never decreases
        assert!(meta.unreachable_bytes() > 0 || i == 0);
    }
    assert!(rewrote, "the rewrite threshold was never hit");

    // The rewritten file still round-trips the whole tree
    let map = repo.open_dirstate_map()?;
    assert_eq!(map.get_map().len(), 21);
    assert!(map.get_map().get(HgPath::new(b"big/07"))?.is_some());
    Ok(())
}

fn write_file(path: &Path, contents: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}

fn sorted_strings(paths: &[std::borrow::Cow<'_, HgPath>]) -> Vec<String> {
    let mut paths: Vec<String> =
        paths.iter().map(|path| path.to_string()).collect();
    paths.sort();
    paths
}

#[test]
fn test_status_classification() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    fs::create_dir_all(root.join(".hg")).unwrap();
    write_file(&root.join("clean.txt"), b"clean");
    write_file(&root.join("modified.txt"), b"some new contents");
    write_file(&root.join("removed.txt"), b"still here");
    write_file(&root.join("unknown.txt"), b"?");
    write_file(&root.join("junk.ignored"), b"~");

    let mut dmap = DirstateMap::empty(b"");
    let clean_metadata = fs::metadata(root.join("clean.txt")).unwrap();
    let clean_mtime =
        TruncatedTimestamp::for_mtime_of(&clean_metadata).unwrap();
    dmap.set_entry(
        HgPath::new(b"clean.txt"),
        DirstateEntry::from_v2_data(DirstateV2Data {
            wc_tracked: true,
            p1_tracked: true,
            mode_size: Some((0o644, clean_metadata.len() as u32)),
            mtime: Some(clean_mtime),
            ..Default::default()
        }),
    )
    .unwrap();
    // Size on record differs from the file
    dmap.set_entry(HgPath::new(b"modified.txt"), clean_entry(1, 1, 0))
        .unwrap();
    // No longer tracked, but present in the first parent and on disk
    dmap.set_entry(
        HgPath::new(b"removed.txt"),
        DirstateEntry::from_v2_data(DirstateV2Data {
            p1_tracked: true,
            ..Default::default()
        }),
    )
    .unwrap();
    // Tracked but gone from the filesystem
    dmap.set_entry(HgPath::new(b"missing.txt"), clean_entry(1, 1, 0))
        .unwrap();

    let ignore = IgnoreConfig {
        ignore_fn: Box::new(|path: &HgPath| {
            path.as_bytes().ends_with(b".ignored")
        }),
        patterns_hash: None,
    };
    let outcome = status(
        &mut dmap,
        root,
        ignore,
        StatusOptions {
            check_exec: false,
            list_clean: true,
            list_unknown: true,
            list_ignored: true,
            collect_traversed_dirs: false,
        },
    )
    .unwrap();

    assert_eq!(sorted_strings(&outcome.clean), ["clean.txt"]);
    assert_eq!(sorted_strings(&outcome.modified), ["modified.txt"]);
    assert_eq!(sorted_strings(&outcome.removed), ["removed.txt"]);
    assert_eq!(sorted_strings(&outcome.deleted), ["missing.txt"]);
    assert_eq!(sorted_strings(&outcome.unknown), ["unknown.txt"]);
    assert_eq!(sorted_strings(&outcome.ignored), ["junk.ignored"]);
    assert!(outcome.added.is_empty());
    assert!(outcome.unsure.is_empty());
}

#[test]
fn test_status_expected_state_is_modified() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    fs::create_dir_all(root.join(".hg")).unwrap();
    write_file(&root.join("file.txt"), b"contents");

    let metadata = fs::metadata(root.join("file.txt")).unwrap();
    let mtime = TruncatedTimestamp::for_mtime_of(&metadata).unwrap();
    let mut dmap = DirstateMap::empty(b"");
    dmap.set_entry(
        HgPath::new(b"file.txt"),
        DirstateEntry::from_v2_data(DirstateV2Data {
            wc_tracked: true,
            p1_tracked: true,
            mode_size: Some((0o644, metadata.len() as u32)),
            mtime: Some(mtime),
            expected_state_is_modified: true,
            ..Default::default()
        }),
    )
    .unwrap();

    let outcome = status(
        &mut dmap,
        root,
        IgnoreConfig::default(),
        StatusOptions {
            list_clean: true,
            ..Default::default()
        },
    )
    .unwrap();
    // Metadata matches, but a previous run proved the contents differ:
    // report modified without flagging the file for a content read.
    assert_eq!(sorted_strings(&outcome.modified), ["file.txt"]);
    assert!(outcome.unsure.is_empty());
    assert!(outcome.clean.is_empty());
}

#[test]
fn test_clean_directory_cache_skips_readdir() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    fs::create_dir_all(root.join(".hg")).unwrap();
    write_file(&root.join("d/f"), b"tracked");
    write_file(&root.join("d/u"), b"unknown");

    let mut hasher = IgnorePatternsHasher::new();
    hasher.write(b"syntax: glob\n*.orig\n");
    let hash = hasher.finish();

    let build_map = || {
        let mut dmap = DirstateMap::empty(b"");
        let metadata = fs::metadata(root.join("d/f")).unwrap();
        dmap.set_entry(
            HgPath::new(b"d/f"),
            DirstateEntry::from_v2_data(DirstateV2Data {
                wc_tracked: true,
                p1_tracked: true,
                mode_size: Some((0o644, metadata.len() as u32)),
                mtime: Some(
                    TruncatedTimestamp::for_mtime_of(&metadata).unwrap(),
                ),
                ..Default::default()
            }),
        )
        .unwrap();
        // A cache claiming that `read_dir` results are fully recorded,
        // even though `d/u` has no node: if the walk trusts it, `d/u`
        // must go unreported.
        let dir_metadata = fs::metadata(root.join("d")).unwrap();
        dmap.set_cached_directory(
            HgPath::new(b"d"),
            DirectoryCache {
                mtime: TruncatedTimestamp::for_mtime_of(&dir_metadata)
                    .unwrap(),
                all_unknown_recorded: true,
                all_ignored_recorded: true,
            },
        )
        .unwrap();
        dmap.set_ignore_patterns_hash(hash);
        dmap
    };
    let options = StatusOptions {
        list_clean: true,
        list_unknown: true,
        list_ignored: true,
        ..Default::default()
    };

    // Same ignore hash: the cache is honoured, `read_dir(d)` is skipped
    // and only stored children are visited.
    let mut dmap = build_map();
    let outcome = status(
        &mut dmap,
        root,
        IgnoreConfig {
            ignore_fn: Box::new(|_| false),
            patterns_hash: Some(hash),
        },
        options,
    )
    .unwrap();
    assert!(outcome.unknown.is_empty());
    assert_eq!(sorted_strings(&outcome.clean), ["d/f"]);

    // Different ignore hash: the optimisation must be disabled, and the
    // walk finds the unknown file.
    let mut dmap = build_map();
    let mut other_hasher = IgnorePatternsHasher::new();
    other_hasher.write(b"something else entirely\n");
    let outcome = status(
        &mut dmap,
        root,
        IgnoreConfig {
            ignore_fn: Box::new(|_| false),
            patterns_hash: Some(other_hasher.finish()),
        },
        options,
    )
    .unwrap();
    assert_eq!(sorted_strings(&outcome.unknown), ["d/u"]);
}

#[test]
fn test_status_records_directory_caches() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    fs::create_dir_all(root.join(".hg")).unwrap();
    write_file(&root.join("d/f"), b"tracked");

    let mut hasher = IgnorePatternsHasher::new();
    hasher.write(b"*.orig\n");
    let hash = hasher.finish();

    let mut dmap = DirstateMap::empty(b"");
    let metadata = fs::metadata(root.join("d/f")).unwrap();
    dmap.set_entry(
        HgPath::new(b"d/f"),
        DirstateEntry::from_v2_data(DirstateV2Data {
            wc_tracked: true,
            p1_tracked: true,
            mode_size: Some((0o644, metadata.len() as u32)),
            mtime: Some(TruncatedTimestamp::for_mtime_of(&metadata).unwrap()),
            ..Default::default()
        }),
    )
    .unwrap();

    // Wait for the filesystem clock to move past the directory's mtime,
    // otherwise the cache is (correctly) considered unreliable.
    let dir_mtime = TruncatedTimestamp::for_mtime_of(
        &fs::metadata(root.join("d")).unwrap(),
    )
    .unwrap();
    for _ in 0..1000 {
        let probe = tempfile::NamedTempFile::new_in(root).unwrap();
        let now =
            TruncatedTimestamp::for_mtime_of(&probe.as_file().metadata().unwrap())
                .unwrap();
        if dir_mtime.for_reliable_mtime_of_self(&now).is_some() {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }

    let outcome = status(
        &mut dmap,
        root,
        IgnoreConfig {
            ignore_fn: Box::new(|_| false),
            patterns_hash: Some(hash),
        },
        StatusOptions {
            list_clean: true,
            list_unknown: true,
            ..Default::default()
        },
    )
    .unwrap();
    assert!(outcome.unknown.is_empty());

    // The walk fully reconciled `d`, so it is now cached and the hash is
    // recorded for the next run to validate against.
    let cache = dmap
        .cached_directory(HgPath::new(b"d"))
        .unwrap()
        .expect("directory should have been cached");
    assert!(cache.all_unknown_recorded);
    // Every child of `d` has a dirstate node, so nothing is lost for an
    // ignored-listing run either.
    assert!(cache.all_ignored_recorded);
    assert_eq!(dmap.ignore_patterns_hash(), &hash);
}

use crate::integration::support::{alice, bob, Fixture};
use decompfs::metadata::{prefixes, with_suffix};
use decompfs::node::revisions::split_revision_key;
use decompfs::FsError;
use std::fs;
use std::io::Read;

fn content_attrs(fx: &Fixture, path: &str) -> (String, i64, Vec<Vec<u8>>) {
    let node = fx.node(path);
    let attrs = node.xattrs().unwrap();
    let sums = [
        prefixes::CHECKSUM_SHA1,
        prefixes::CHECKSUM_MD5,
        prefixes::CHECKSUM_ADLER32,
    ]
    .iter()
    .map(|alg| attrs.get(&prefixes::checksum_attr(alg)).unwrap_or_default().to_vec())
    .collect();
    (node.blob_id.clone(), node.blobsize, sums)
}

#[test]
fn fresh_file_has_no_revisions() {
    let fx = Fixture::new();
    fx.put("a.txt", b"only");
    let versions = fx
        .storage
        .list_revisions(&alice(), &fx.reference("a.txt"))
        .unwrap();
    assert!(versions.is_empty());
}

#[test]
fn restoring_twice_returns_to_identical_content() {
    let fx = Fixture::new();
    fx.put("a.txt", b"one");
    fx.put("a.txt", b"two!!");
    let reference = fx.reference("a.txt");
    let current = content_attrs(&fx, "a.txt");
    assert_eq!(current.1, 5);
    assert!(current.2.iter().all(|sum| !sum.is_empty()));

    let first = fx.storage.list_revisions(&alice(), &reference).unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].size, 3);

    let demoted = fx
        .storage
        .restore_revision(&alice(), &reference, &first[0].key)
        .unwrap();
    assert_eq!(fx.read("a.txt"), b"one");
    let after_first = fx.storage.list_revisions(&alice(), &reference).unwrap();
    assert_eq!(after_first.len(), 1);
    assert_eq!(after_first[0].key, demoted);
    assert_eq!(after_first[0].size, 5);

    let demoted_again = fx
        .storage
        .restore_revision(&alice(), &reference, &demoted)
        .unwrap();
    assert_eq!(fx.read("a.txt"), b"two!!");
    assert_eq!(content_attrs(&fx, "a.txt"), current);

    let after_second = fx.storage.list_revisions(&alice(), &reference).unwrap();
    assert_eq!(after_second.len(), 1);
    assert_eq!(after_second[0].key, demoted_again);
    assert_eq!(after_second[0].size, 3);
}

#[test]
fn metadata_files_are_not_listed_as_revisions() {
    let fx = Fixture::new();
    fx.put("a.txt", b"one");
    fx.put("a.txt", b"two");
    let reference = fx.reference("a.txt");
    let key = fx.storage.list_revisions(&alice(), &reference).unwrap()[0]
        .key
        .clone();

    let node = fx.node("a.txt");
    let (_, revision) = split_revision_key(&key);
    let revision_path = node.revision_node(revision).internal_path();
    assert!(revision_path.exists());
    assert!(with_suffix(&revision_path, ".mpk").exists());
    let stray_lock = with_suffix(&revision_path, ".mlock");
    if !stray_lock.exists() {
        fs::write(&stray_lock, b"").unwrap();
    }

    let versions = fx.storage.list_revisions(&alice(), &reference).unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].key, key);
}

#[test]
fn overwrite_in_subdirectory_keeps_old_size_as_revision() {
    let fx = Fixture::new();
    fx.storage
        .create_dir(&alice(), &fx.reference("docs"))
        .unwrap();
    let root_before = fx.root();
    let root_treesize = root_before.treesize().unwrap();
    let root_tmtime = root_before.tmtime().ok();

    fx.put("docs/f.bin", &[7u8; 100]);
    let parent_before = fx.node("docs").treesize().unwrap();
    assert_eq!(parent_before, 100);

    fx.put("docs/f.bin", &[9u8; 150]);

    let versions = fx
        .storage
        .list_revisions(&alice(), &fx.reference("docs/f.bin"))
        .unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].size, 100);
    assert_eq!(fx.node("docs/f.bin").blobsize, 150);
    assert_eq!(fx.node("docs").treesize().unwrap(), parent_before + 50);

    let root_after = fx.root();
    assert_eq!(root_after.treesize().unwrap(), root_treesize);
    assert_eq!(root_after.tmtime().ok(), root_tmtime);
}

#[test]
fn revision_content_can_be_downloaded_and_deleted() {
    let fx = Fixture::new();
    fx.put("a.txt", b"one");
    fx.put("a.txt", b"two");
    let reference = fx.reference("a.txt");
    let key = fx.storage.list_revisions(&alice(), &reference).unwrap()[0]
        .key
        .clone();

    let mut old = String::new();
    fx.storage
        .download_revision(&alice(), &reference, &key)
        .unwrap()
        .read_to_string(&mut old)
        .unwrap();
    assert_eq!(old, "one");

    fx.storage
        .delete_revision(&alice(), &reference, &key)
        .unwrap();
    assert!(fx.storage.list_revisions(&alice(), &reference).unwrap().is_empty());
    assert_eq!(fx.read("a.txt"), b"two");
    assert!(matches!(
        fx.storage.download_revision(&alice(), &reference, &key),
        Err(FsError::NotFound(_))
    ));
}

#[test]
fn non_owner_cannot_delete_or_restore_revisions() {
    let fx = Fixture::new();
    fx.put("a.txt", b"one");
    fx.put("a.txt", b"two");
    let reference = fx.reference("a.txt");
    let key = fx.storage.list_revisions(&alice(), &reference).unwrap()[0]
        .key
        .clone();

    assert!(matches!(
        fx.storage.delete_revision(&bob(), &reference, &key),
        Err(FsError::PermissionDenied(_))
    ));
    // without stat permission the file is hidden
    assert!(matches!(
        fx.storage.restore_revision(&bob(), &reference, &key),
        Err(FsError::NotFound(_))
    ));

    let versions = fx.storage.list_revisions(&alice(), &reference).unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].key, key);
    assert_eq!(fx.read("a.txt"), b"two");
}

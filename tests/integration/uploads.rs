use crate::integration::support::{alice, bob, Fixture};
use decompfs::upload::session::{update_metadata, Session};
use decompfs::{FsError, Lock, UploadOptions};
use chrono::{Duration, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn concurrent_metadata_updates_converge_on_one_node() {
    let fx = Fixture::new();
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let storage = fx.storage.clone();
            let space_id = fx.space.id.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let session = Session {
                    id: format!("upload-{}", i),
                    filename: "same.txt".to_string(),
                    space_root: space_id.clone(),
                    node_parent_id: space_id,
                    size: 1,
                    ..Default::default()
                };
                barrier.wait();
                update_metadata(&alice(), storage.tree(), &format!("upload-{}", i), 1, session)
                    .map(|(_, node)| node.id)
            })
        })
        .collect();

    let ids: HashSet<String> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();
    assert_eq!(ids.len(), 1);

    let entries = fx
        .storage
        .list_folder(&alice(), &fx.reference(""))
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "same.txt");
}

#[test]
fn concurrent_uploads_leave_one_file() {
    let fx = Fixture::new();
    let handles: Vec<_> = (0..4u8)
        .map(|i| {
            let storage = fx.storage.clone();
            let reference = fx.reference("race.txt");
            thread::spawn(move || {
                storage.upload(&alice(), &reference, &[i; 10][..], UploadOptions::default())
            })
        })
        .collect();
    let succeeded = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(Result::is_ok)
        .count();
    assert!(succeeded >= 1);

    let entries = fx.storage.list_folder(&alice(), &fx.reference("")).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].size, 10);
    assert!(!entries[0].processing);
    let revisions = fx
        .storage
        .list_revisions(&alice(), &fx.reference("race.txt"))
        .unwrap();
    assert_eq!(revisions.len(), succeeded - 1);
}

#[test]
fn expected_checksum_is_verified() {
    let fx = Fixture::new();
    let good = UploadOptions {
        checksum: Some("sha1 aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d".to_string()),
        ..Default::default()
    };
    let info = fx
        .storage
        .upload(&alice(), &fx.reference("hello.txt"), &b"hello"[..], good)
        .unwrap();
    assert_eq!(
        info.checksum.as_deref(),
        Some("aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d")
    );

    let bad = UploadOptions {
        checksum: Some("md5:00000000000000000000000000000000".to_string()),
        ..Default::default()
    };
    assert!(matches!(
        fx.storage
            .upload(&alice(), &fx.reference("hello.txt"), &b"other"[..], bad),
        Err(FsError::PreconditionFailed(_))
    ));
    assert_eq!(fx.read("hello.txt"), b"hello");
    assert!(fx
        .storage
        .list_revisions(&alice(), &fx.reference("hello.txt"))
        .unwrap()
        .is_empty());
}

#[test]
fn if_match_guards_overwrites() {
    let fx = Fixture::new();
    fx.put("a.txt", b"one");
    let etag = fx.storage.get_md(&alice(), &fx.reference("a.txt")).unwrap().etag;

    let stale = UploadOptions {
        if_match: Some("\"stale\"".to_string()),
        ..Default::default()
    };
    assert!(matches!(
        fx.storage.upload(&alice(), &fx.reference("a.txt"), &b"two"[..], stale),
        Err(FsError::PreconditionFailed(_))
    ));

    let current = UploadOptions {
        if_match: Some(etag),
        ..Default::default()
    };
    fx.storage
        .upload(&alice(), &fx.reference("a.txt"), &b"two"[..], current)
        .unwrap();
    assert_eq!(fx.read("a.txt"), b"two");
}

#[test]
fn locked_file_needs_the_lock_token() {
    let fx = Fixture::new();
    fx.put("a.txt", b"one");
    fx.storage
        .set_lock(&alice(), &fx.reference("a.txt"), &Lock::new("token-1"))
        .unwrap();

    assert!(matches!(
        fx.storage.upload(
            &alice(),
            &fx.reference("a.txt"),
            &b"two"[..],
            UploadOptions::default()
        ),
        Err(FsError::Locked(_))
    ));
    let with_token = UploadOptions {
        lock_id: Some("token-1".to_string()),
        ..Default::default()
    };
    fx.storage
        .upload(&alice(), &fx.reference("a.txt"), &b"two"[..], with_token)
        .unwrap();
    assert_eq!(fx.read("a.txt"), b"two");
}

#[test]
fn non_owner_cannot_see_upload_target() {
    let fx = Fixture::new();
    assert!(matches!(
        fx.storage.initiate_upload(
            &bob(),
            &fx.reference("a.txt"),
            Some(3),
            UploadOptions::default()
        ),
        Err(FsError::NotFound(_))
    ));
}

#[test]
fn purge_clears_abandoned_sessions() {
    let fx = Fixture::new();
    let abandoned = fx
        .storage
        .initiate_upload(&alice(), &fx.reference("a.txt"), Some(3), UploadOptions::default())
        .unwrap();
    fx.storage
        .write_upload_chunk(&alice(), &abandoned, 0, b"ab")
        .unwrap();

    assert_eq!(fx.storage.purge_expired_uploads(Utc::now()).unwrap(), 0);
    let later = Utc::now() + Duration::hours(25);
    assert_eq!(fx.storage.purge_expired_uploads(later).unwrap(), 1);
    assert!(matches!(
        fx.storage.get_upload(&alice(), &abandoned),
        Err(FsError::NotFound(_))
    ));
}

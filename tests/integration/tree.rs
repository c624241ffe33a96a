use crate::integration::support::{alice, bob, Fixture};
use decompfs::{CancellationToken, FsError, NodeType};

#[test]
fn moves_carry_size_between_parents() {
    let fx = Fixture::new();
    fx.storage.create_dir(&alice(), &fx.reference("a")).unwrap();
    fx.storage.create_dir(&alice(), &fx.reference("b")).unwrap();
    fx.put("a/f.txt", &[1u8; 10]);
    assert_eq!(fx.node("a").treesize().unwrap(), 10);

    let moved = fx
        .storage
        .move_node(&alice(), &fx.reference("a/f.txt"), &fx.reference("b/g.txt"))
        .unwrap();
    assert_eq!(moved.name, "g.txt");
    assert_eq!(fx.node("a").treesize().unwrap(), 0);
    assert_eq!(fx.node("b").treesize().unwrap(), 10);
    assert_eq!(
        fx.storage.get_path(&alice(), &fx.reference("b/g.txt")).unwrap(),
        "/b/g.txt"
    );
    assert!(matches!(
        fx.storage.get_md(&alice(), &fx.reference("a/f.txt")),
        Err(FsError::NotFound(_))
    ));
}

#[test]
fn move_onto_existing_target_is_rejected() {
    let fx = Fixture::new();
    fx.put("a.txt", b"a");
    fx.put("b.txt", b"b");
    assert!(matches!(
        fx.storage
            .move_node(&alice(), &fx.reference("a.txt"), &fx.reference("b.txt")),
        Err(FsError::AlreadyExists(_))
    ));
    assert_eq!(fx.read("b.txt"), b"b");
}

#[test]
fn delete_removes_entry_and_size() {
    let fx = Fixture::new();
    fx.storage.create_dir(&alice(), &fx.reference("docs")).unwrap();
    fx.put("docs/f.txt", &[0u8; 42]);
    assert_eq!(fx.node("docs").treesize().unwrap(), 42);

    fx.storage.delete(&alice(), &fx.reference("docs/f.txt")).unwrap();
    assert_eq!(fx.node("docs").treesize().unwrap(), 0);
    assert!(fx
        .storage
        .list_folder(&alice(), &fx.reference("docs"))
        .unwrap()
        .is_empty());
}

#[test]
fn listing_reports_types_and_sizes() {
    let fx = Fixture::new();
    fx.storage.create_dir(&alice(), &fx.reference("dir")).unwrap();
    fx.put("file.txt", b"12345");

    let mut entries = fx.storage.list_folder(&alice(), &fx.reference("")).unwrap();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].name, "dir");
    assert_eq!(entries[0].node_type, NodeType::Container);
    assert_eq!(entries[1].name, "file.txt");
    assert_eq!(entries[1].node_type, NodeType::File);
    assert_eq!(entries[1].size, 5);

    assert!(matches!(
        fx.storage.download(&alice(), &fx.reference("dir")),
        Err(FsError::InvalidArgument(_))
    ));
}

#[test]
fn other_users_see_nothing() {
    let fx = Fixture::new();
    fx.put("secret.txt", b"s");
    assert!(matches!(
        fx.storage.list_folder(&bob(), &fx.reference("")),
        Err(FsError::NotFound(_))
    ));
    assert!(matches!(
        fx.storage.delete(&bob(), &fx.reference("secret.txt")),
        Err(FsError::NotFound(_))
    ));
    assert_eq!(fx.read("secret.txt"), b"s");
    assert!(fx.storage.list_spaces(&bob()).unwrap().is_empty());
    assert_eq!(fx.storage.list_spaces(&alice()).unwrap().len(), 1);
}

#[test]
fn cancelled_requests_abort() {
    let fx = Fixture::new();
    fx.storage.create_dir(&alice(), &fx.reference("dir")).unwrap();
    let token = CancellationToken::new();
    let ctx = alice().with_cancellation(token.clone());
    token.cancel();
    assert!(matches!(
        fx.storage.list_folder(&ctx, &fx.reference("dir")),
        Err(FsError::Aborted(_))
    ));
}

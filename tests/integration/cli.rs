use clap::Parser;
use decompfs::tooling::cli::{Cli, CliContext};
use std::fs;
use tempfile::TempDir;

fn run(root: &TempDir, args: &[&str]) -> Result<String, decompfs::FsError> {
    let root_arg = root.path().join("storage");
    let mut argv = vec![
        "decompfs".to_string(),
        "--root".to_string(),
        root_arg.display().to_string(),
        "--user".to_string(),
        "idp:alice".to_string(),
        "--format".to_string(),
        "json".to_string(),
        "--log-level".to_string(),
        "off".to_string(),
        "--log-output".to_string(),
        "stderr".to_string(),
    ];
    argv.extend(args.iter().map(|a| a.to_string()));
    let cli = Cli::try_parse_from(argv).unwrap();
    let context = CliContext::new(&cli)?;
    context.execute(&cli.command)
}

#[test]
fn put_overwrite_and_restore_through_cli() {
    let dir = TempDir::new().unwrap();
    let created: serde_json::Value =
        serde_json::from_str(&run(&dir, &["space", "create", "home"]).unwrap()).unwrap();
    let space = created["id"].as_str().unwrap().to_string();

    let source = dir.path().join("local.txt");
    fs::write(&source, "first").unwrap();
    run(&dir, &["put", &space, "notes.txt", source.to_str().unwrap()]).unwrap();
    fs::write(&source, "second version").unwrap();
    run(&dir, &["put", &space, "notes.txt", source.to_str().unwrap()]).unwrap();

    let versions: serde_json::Value =
        serde_json::from_str(&run(&dir, &["versions", "list", &space, "notes.txt"]).unwrap())
            .unwrap();
    let versions = versions.as_array().unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0]["size"], 5);
    let key = versions[0]["key"].as_str().unwrap().to_string();

    run(&dir, &["versions", "restore", &space, "notes.txt", &key]).unwrap();
    let out = dir.path().join("out.txt");
    run(
        &dir,
        &["get", &space, "notes.txt", "--output", out.to_str().unwrap()],
    )
    .unwrap();
    assert_eq!(fs::read_to_string(&out).unwrap(), "first");

    let listing: serde_json::Value =
        serde_json::from_str(&run(&dir, &["ls", &space]).unwrap()).unwrap();
    assert_eq!(listing.as_array().unwrap().len(), 1);
    assert_eq!(listing[0]["size"], 5);
}

#[test]
fn registry_lists_the_storage_provider() {
    let dir = TempDir::new().unwrap();
    let services: serde_json::Value =
        serde_json::from_str(&run(&dir, &["registry", "list"]).unwrap()).unwrap();
    let nodes = services["storage-provider"].as_array().unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0]["metadata"]["type"], "decompfs");
}

#[test]
fn missing_paths_fail_with_not_found() {
    let dir = TempDir::new().unwrap();
    let created: serde_json::Value =
        serde_json::from_str(&run(&dir, &["space", "create", "home"]).unwrap()).unwrap();
    let space = created["id"].as_str().unwrap().to_string();
    let err = run(&dir, &["stat", &space, "nope.txt"]).unwrap_err();
    assert_eq!(err.status_code(), 404);
}

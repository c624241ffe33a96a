//! CLI Tooling
//!
//! Command-line interface over a storage root: spaces, tree operations,
//! uploads, revisions, locks and the service registry. Every command runs as
//! a single user and prints either a text table or pretty JSON.

use crate::config::{ConfigLoader, GatewayConfig};
use crate::context::RequestContext;
use crate::error::FsError;
use crate::logging::{init_logging, resolve_log_file_path};
use crate::node::locks::Lock;
use crate::node::permissions::AllowAll;
use crate::registry::{Registry, Service, ServiceNode};
use crate::storage::Storage;
use crate::types::{FileVersion, NodeType, Reference, ResourceInfo, StorageSpace, User, UserId};
use crate::upload::UploadOptions;
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use comfy_table::Table;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Name the storage provider registers under.
pub const STORAGE_PROVIDER_SERVICE: &str = "storage-provider";

/// decompfs CLI - decomposed filesystem storage administration
#[derive(Parser)]
#[command(name = "decompfs")]
#[command(about = "Administer a decomposed filesystem storage root")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Storage root (overrides storage.root from configuration)
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Configuration file path (layered over the global config file)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Act as this user, either `idp:id` or a bare id (default: login name)
    #[arg(long)]
    pub user: Option<String>,

    /// Bypass ownership checks
    #[arg(long)]
    pub admin: bool,

    /// Lock token presented with mutating commands
    #[arg(long)]
    pub lock_token: Option<String>,

    /// Output format (text or json)
    #[arg(long, default_value = "text")]
    pub format: String,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file, file+stderr, both)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Log file path (if output includes "file")
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage spaces
    Space {
        #[command(subcommand)]
        command: SpaceCommands,
    },
    /// Create a directory
    Mkdir {
        /// Space ID
        space: String,
        /// Space relative path
        path: String,
    },
    /// Upload a local file
    Put {
        /// Space ID
        space: String,
        /// Space relative target path
        path: String,
        /// Local file to upload
        source: PathBuf,
        /// Expected checksum, e.g. "sha1 2fd4e1c6..."
        #[arg(long)]
        checksum: Option<String>,
        /// Only overwrite when the current etag matches
        #[arg(long)]
        if_match: Option<String>,
        /// Keep the source file's modification time
        #[arg(long)]
        preserve_mtime: bool,
    },
    /// Download a file
    Get {
        /// Space ID
        space: String,
        /// Space relative path
        path: String,
        /// Write to this file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// List a directory
    Ls {
        /// Space ID
        space: String,
        /// Space relative path
        #[arg(default_value = ".")]
        path: String,
    },
    /// Show metadata of a node
    Stat {
        /// Space ID
        space: String,
        /// Space relative path
        path: String,
    },
    /// Move or rename a node within a space
    Mv {
        /// Space ID
        space: String,
        from: String,
        to: String,
    },
    /// Delete a node
    Rm {
        /// Space ID
        space: String,
        /// Space relative path
        path: String,
    },
    /// Manage file revisions
    Versions {
        #[command(subcommand)]
        command: VersionCommands,
    },
    /// Lock a node
    Lock {
        /// Space ID
        space: String,
        /// Space relative path
        path: String,
        /// Lock token (generated when omitted)
        #[arg(long)]
        lock_id: Option<String>,
        /// Application holding the lock
        #[arg(long, default_value = "decompfs")]
        app_name: String,
        /// Lifetime in seconds (no expiry when omitted)
        #[arg(long)]
        expires_in: Option<i64>,
    },
    /// Remove a lock
    Unlock {
        /// Space ID
        space: String,
        /// Space relative path
        path: String,
        /// Lock token to remove
        lock_id: String,
    },
    /// Manage upload sessions
    Uploads {
        #[command(subcommand)]
        command: UploadCommands,
    },
    /// Inspect the service registry
    Registry {
        #[command(subcommand)]
        command: RegistryCommands,
    },
}

#[derive(Subcommand)]
pub enum SpaceCommands {
    /// Create a space owned by the current user
    Create {
        /// Display name
        name: String,
    },
    /// List spaces visible to the current user
    List,
}

#[derive(Subcommand)]
pub enum VersionCommands {
    /// List revisions of a file
    List {
        space: String,
        path: String,
    },
    /// Download a revision
    Get {
        space: String,
        path: String,
        /// Revision key
        key: String,
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Make a revision the current content
    Restore {
        space: String,
        path: String,
        key: String,
    },
    /// Delete a revision
    Rm {
        space: String,
        path: String,
        key: String,
    },
}

#[derive(Subcommand)]
pub enum UploadCommands {
    /// Remove expired upload sessions
    Purge,
}

#[derive(Subcommand)]
pub enum RegistryCommands {
    /// List registered services
    List,
}

/// CLI context for executing commands
pub struct CliContext {
    storage: Storage,
    registry: Arc<Registry>,
    user: User,
    lock_token: Option<String>,
    format: String,
}

impl CliContext {
    /// Load configuration, open the storage root, install logging and
    /// register this process as a storage provider.
    pub fn new(cli: &Cli) -> Result<Self, FsError> {
        let mut config = match &cli.config {
            Some(path) => ConfigLoader::load_with_file(path)?,
            None => ConfigLoader::load()?,
        };
        apply_overrides(&mut config, cli);

        let root = config.storage.resolve_root()?;
        config.storage.root = Some(root.clone());

        let mut storage = Storage::from_config(&config)?;
        if cli.admin {
            storage = storage.with_permissions(Arc::new(AllowAll));
        }

        if config.logging.output.contains("file") || config.logging.output == "both" {
            config.logging.file = Some(resolve_log_file_path(
                cli.log_file.clone(),
                config.logging.file.clone(),
                Some(&root),
            )?);
        }
        if let Err(e) = init_logging(Some(&config.logging)) {
            eprintln!("Warning: logging disabled: {}", e);
        }

        let registry = Arc::new(Registry::from_config(&config.registry));
        registry.add(provider_service(&config, storage.options().provider_id.as_str()));

        let user = parse_user(cli.user.as_deref())?;
        info!(root = %root.display(), user = %user.username, "storage opened");

        Ok(Self {
            storage,
            registry,
            user,
            lock_token: cli.lock_token.clone(),
            format: cli.format.clone(),
        })
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn request_context(&self) -> RequestContext {
        let ctx = RequestContext::new(self.user.clone());
        match &self.lock_token {
            Some(token) => ctx.with_lock_id(token.clone()),
            None => ctx,
        }
    }

    fn json(&self) -> bool {
        self.format == "json"
    }

    /// Execute a CLI command
    pub fn execute(&self, command: &Commands) -> Result<String, FsError> {
        let ctx = self.request_context();
        match command {
            Commands::Space { command } => match command {
                SpaceCommands::Create { name } => {
                    let space = self.storage.create_space(&ctx, name)?;
                    if self.json() {
                        return to_json(&space);
                    }
                    Ok(format!("Created space {} ({})", space.id, space.name))
                }
                SpaceCommands::List => {
                    let spaces = self.storage.list_spaces(&ctx)?;
                    if self.json() {
                        return to_json(&spaces);
                    }
                    Ok(format_spaces(&spaces))
                }
            },
            Commands::Mkdir { space, path } => {
                let info = self.storage.create_dir(&ctx, &space_ref(space, path))?;
                if self.json() {
                    return to_json(&info);
                }
                Ok(format!("Created directory {} ({})", path, info.id))
            }
            Commands::Put {
                space,
                path,
                source,
                checksum,
                if_match,
                preserve_mtime,
            } => {
                let file = File::open(source)?;
                let mtime = if *preserve_mtime {
                    Some(DateTime::<Utc>::from(file.metadata()?.modified()?))
                } else {
                    None
                };
                let options = UploadOptions {
                    checksum: checksum.clone(),
                    mtime,
                    if_match: if_match.clone(),
                    lock_id: self.lock_token.clone(),
                    ..Default::default()
                };
                let info = self
                    .storage
                    .upload(&ctx, &space_ref(space, path), file, options)?;
                if self.json() {
                    return to_json(&info);
                }
                Ok(format!("Uploaded {} ({} bytes, etag {})", path, info.size, info.etag))
            }
            Commands::Get { space, path, output } => {
                let reader = self.storage.download(&ctx, &space_ref(space, path))?;
                write_content(reader, output.as_ref())
            }
            Commands::Ls { space, path } => {
                let entries = self.storage.list_folder(&ctx, &space_ref(space, path))?;
                if self.json() {
                    return to_json(&entries);
                }
                Ok(format_entries(&entries))
            }
            Commands::Stat { space, path } => {
                let reference = space_ref(space, path);
                let info = self.storage.get_md(&ctx, &reference)?;
                let lock = self.storage.get_lock(&ctx, &reference)?;
                if self.json() {
                    return to_json(&StatOutput { info, lock });
                }
                Ok(format_stat(&info, lock.as_ref()))
            }
            Commands::Mv { space, from, to } => {
                let info = self
                    .storage
                    .move_node(&ctx, &space_ref(space, from), &space_ref(space, to))?;
                if self.json() {
                    return to_json(&info);
                }
                Ok(format!("Moved {} to {}", from, to))
            }
            Commands::Rm { space, path } => {
                self.storage.delete(&ctx, &space_ref(space, path))?;
                Ok(format!("Deleted {}", path))
            }
            Commands::Versions { command } => self.execute_versions(&ctx, command),
            Commands::Lock {
                space,
                path,
                lock_id,
                app_name,
                expires_in,
            } => {
                let mut lock = Lock::new(
                    lock_id
                        .clone()
                        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                );
                lock.owner = Some(self.user.id.clone());
                lock.app_name = app_name.clone();
                lock.expiration = expires_in.map(|secs| Utc::now() + Duration::seconds(secs));
                self.storage.set_lock(&ctx, &space_ref(space, path), &lock)?;
                if self.json() {
                    return to_json(&lock);
                }
                Ok(format!("Locked {} with token {}", path, lock.lock_id))
            }
            Commands::Unlock { space, path, lock_id } => {
                self.storage.unlock(&ctx, &space_ref(space, path), lock_id)?;
                Ok(format!("Unlocked {}", path))
            }
            Commands::Uploads { command } => match command {
                UploadCommands::Purge => {
                    let purged = self.storage.purge_expired_uploads(Utc::now())?;
                    if self.json() {
                        return to_json(&serde_json::json!({ "purged": purged }));
                    }
                    Ok(format!("Purged {} expired upload(s)", purged))
                }
            },
            Commands::Registry { command } => match command {
                RegistryCommands::List => {
                    let mut services = BTreeMap::new();
                    for name in self.registry.service_names() {
                        services.insert(name.clone(), self.registry.nodes(&name));
                    }
                    if self.json() {
                        return to_json(&services);
                    }
                    Ok(format_services(&services))
                }
            },
        }
    }

    fn execute_versions(
        &self,
        ctx: &RequestContext,
        command: &VersionCommands,
    ) -> Result<String, FsError> {
        match command {
            VersionCommands::List { space, path } => {
                let versions = self.storage.list_revisions(ctx, &space_ref(space, path))?;
                if self.json() {
                    return to_json(&versions);
                }
                Ok(format_versions(&versions))
            }
            VersionCommands::Get {
                space,
                path,
                key,
                output,
            } => {
                let reader = self
                    .storage
                    .download_revision(ctx, &space_ref(space, path), key)?;
                write_content(reader, output.as_ref())
            }
            VersionCommands::Restore { space, path, key } => {
                let demoted = self
                    .storage
                    .restore_revision(ctx, &space_ref(space, path), key)?;
                if self.json() {
                    return to_json(&serde_json::json!({
                        "restored": key,
                        "previous_content": demoted,
                    }));
                }
                Ok(format!(
                    "Restored {} to {}; previous content kept as {}",
                    path, key, demoted
                ))
            }
            VersionCommands::Rm { space, path, key } => {
                self.storage
                    .delete_revision(ctx, &space_ref(space, path), key)?;
                Ok(format!("Deleted revision {} of {}", key, path))
            }
        }
    }
}

#[derive(Serialize)]
struct StatOutput {
    #[serde(flatten)]
    info: ResourceInfo,
    lock: Option<Lock>,
}

fn apply_overrides(config: &mut GatewayConfig, cli: &Cli) {
    if let Some(root) = &cli.root {
        config.storage.root = Some(root.clone());
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        config.logging.format = format.clone();
    }
    if let Some(output) = &cli.log_output {
        config.logging.output = output.clone();
    }
}

fn provider_service(config: &GatewayConfig, provider_id: &str) -> Service {
    let mut metadata = BTreeMap::new();
    metadata.insert("type".to_string(), "decompfs".to_string());
    metadata.insert(
        "metadata_backend".to_string(),
        config.storage.metadata_backend.to_string(),
    );
    let address = config
        .storage
        .root
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    Service {
        name: STORAGE_PROVIDER_SERVICE.to_string(),
        nodes: vec![ServiceNode {
            id: provider_id.to_string(),
            address,
            metadata,
        }],
    }
}

/// `idp:id` or a bare id in the `local` idp. Defaults to the login name.
pub fn parse_user(raw: Option<&str>) -> Result<User, FsError> {
    let raw = match raw {
        Some(s) => s.to_string(),
        None => std::env::var("USER")
            .or_else(|_| std::env::var("LOGNAME"))
            .unwrap_or_else(|_| "local".to_string()),
    };
    let (idp, id) = match raw.split_once(':') {
        Some((idp, id)) => (idp, id),
        None => ("local", raw.as_str()),
    };
    if idp.is_empty() || id.is_empty() {
        return Err(FsError::InvalidArgument(format!("invalid user {:?}", raw)));
    }
    Ok(User::new(UserId::new(idp, id), id))
}

/// Reference to `path` relative to the root of `space`.
pub fn space_ref(space: &str, path: &str) -> Reference {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() || trimmed == "." {
        return Reference::space_path(space, ".");
    }
    Reference::space_path(space, format!("./{}", trimmed))
}

fn write_content(mut reader: Box<dyn io::Read + Send>, output: Option<&PathBuf>) -> Result<String, FsError> {
    match output {
        Some(path) => {
            let mut file = File::create(path)?;
            let written = io::copy(&mut reader, &mut file)?;
            file.sync_all()?;
            Ok(format!("Wrote {} bytes to {}", written, path.display()))
        }
        None => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            io::copy(&mut reader, &mut handle)?;
            handle.flush()?;
            Ok(String::new())
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, FsError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| FsError::Internal(format!("Failed to serialize output: {}", e)))
}

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table.load_preset(comfy_table::presets::UTF8_FULL);
    table.set_header(header);
    table
}

fn format_spaces(spaces: &[StorageSpace]) -> String {
    if spaces.is_empty() {
        return "No spaces.".to_string();
    }
    let mut table = new_table(vec!["ID", "Name", "Owner", "Size"]);
    for space in spaces {
        let owner = space
            .owner
            .as_ref()
            .map(|o| format!("{}:{}", o.idp, o.opaque_id))
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            space.id.clone(),
            space.name.clone(),
            owner,
            space.size.to_string(),
        ]);
    }
    table.to_string()
}

fn type_label(node_type: NodeType) -> &'static str {
    match node_type {
        NodeType::File => "file",
        NodeType::Container => "dir",
        NodeType::Invalid => "?",
    }
}

fn format_entries(entries: &[ResourceInfo]) -> String {
    if entries.is_empty() {
        return "Empty directory.".to_string();
    }
    let mut table = new_table(vec!["Name", "Type", "Size", "Modified", "ETag"]);
    for entry in entries {
        table.add_row(vec![
            entry.name.clone(),
            type_label(entry.node_type).to_string(),
            entry.size.to_string(),
            entry.mtime.to_rfc3339(),
            entry.etag.clone(),
        ]);
    }
    table.to_string()
}

fn format_stat(info: &ResourceInfo, lock: Option<&Lock>) -> String {
    let mut table = new_table(vec!["Field", "Value"]);
    table.add_row(vec!["Name".to_string(), info.name.clone()]);
    table.add_row(vec!["ID".to_string(), info.id.to_string()]);
    table.add_row(vec!["Parent".to_string(), info.parent_id.clone()]);
    table.add_row(vec!["Type".to_string(), type_label(info.node_type).to_string()]);
    table.add_row(vec!["Size".to_string(), info.size.to_string()]);
    table.add_row(vec!["ETag".to_string(), info.etag.clone()]);
    table.add_row(vec!["Modified".to_string(), info.mtime.to_rfc3339()]);
    table.add_row(vec![
        "SHA1".to_string(),
        info.checksum.clone().unwrap_or_else(|| "-".to_string()),
    ]);
    if info.processing {
        table.add_row(vec!["Processing".to_string(), "yes".to_string()]);
    }
    if let Some(lock) = lock {
        table.add_row(vec!["Lock".to_string(), format!("{} ({})", lock.lock_id, lock.app_name)]);
    }
    table.to_string()
}

fn format_versions(versions: &[FileVersion]) -> String {
    if versions.is_empty() {
        return "No revisions.".to_string();
    }
    let mut table = new_table(vec!["Key", "Modified", "Size", "ETag"]);
    for version in versions {
        let modified = DateTime::<Utc>::from_timestamp(version.mtime as i64, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| version.mtime.to_string());
        table.add_row(vec![
            version.key.clone(),
            modified,
            version.size.to_string(),
            version.etag.clone(),
        ]);
    }
    table.to_string()
}

fn format_services(services: &BTreeMap<String, Vec<ServiceNode>>) -> String {
    if services.is_empty() {
        return "No services registered.".to_string();
    }
    let mut table = new_table(vec!["Service", "Node", "Address", "Metadata"]);
    for (name, nodes) in services {
        for node in nodes {
            let metadata = node
                .metadata
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(", ");
            table.add_row(vec![name.clone(), node.id.clone(), node.address.clone(), metadata]);
        }
    }
    table.to_string()
}

//! filehandler-cli - drive the file handlers from the command line
//!
//! Usage:
//!   filehandler-cli -p <profile> check [path]          Preflight connection check
//!   filehandler-cli -p <profile> ls [dir]              List one page of a directory
//!   filehandler-cli -p <profile> get <remote> [local]  Download a file
//!   filehandler-cli -p <profile> put <local> <dest>    Upload a file
//!
//! Profiles live in a JSON file; see `--config`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use filehandlers::config::{resolve_config_path, HandlerProfiles};
use filehandlers::handlers::DEFAULT_PAGE_SIZE;
use filehandlers::{FileHandler, FileInfo, PageToken};

#[derive(Parser)]
#[command(
    name = "filehandler-cli",
    about = "FTP, SFTP and Google Drive through one set of commands",
    version,
    long_about = "Runs file operations against a named connection profile.\n\
                  Profiles are read from --config, $FILEHANDLERS_CONFIG, or the user config directory."
)]
struct Cli {
    /// Profile file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Profile name inside the profile file
    #[arg(short, long, global = true, default_value = "default")]
    profile: String,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the backend is reachable and the folder exists
    Check {
        #[arg(default_value = "/")]
        path: String,
    },
    /// List a directory (Drive: folder id)
    Ls {
        #[arg(default_value = "")]
        dir: String,
        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        page_size: u32,
        /// Continuation token printed by a previous listing
        #[arg(long)]
        page_token: Option<String>,
    },
    /// Look up a single file by id or (partial) name
    Lookup {
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        folder: Option<String>,
    },
    /// Download a file (to stdout when no local path is given)
    Get {
        remote: String,
        local: Option<PathBuf>,
    },
    /// Upload a local file into a destination directory (Drive: folder id)
    Put {
        local: PathBuf,
        destination: String,
        /// Remote file name (default: local file name)
        #[arg(long)]
        name: Option<String>,
    },
    /// Move a file (Drive: file id and destination folder id)
    Mv { source: String, destination: String },
    /// Create a directory
    Mkdir { path: String },
    /// Check whether a path exists
    Exists { path: String },
    /// Delete a file
    Rm { identifier: String },
}

/// Numeric tokens are page numbers; anything else is a server cursor
fn parse_page_token(raw: &str) -> PageToken {
    match raw.parse::<u32>() {
        Ok(page) => PageToken::Page(page),
        Err(_) => PageToken::Cursor(raw.to_string()),
    }
}

fn print_entry(entry: &FileInfo) {
    let created = entry
        .created_time
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{:>12}  {:16}  {:28}  {}",
        entry.size, created, entry.mime_type, entry.name
    );
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = resolve_config_path(cli.config.as_deref());
    let profiles = HandlerProfiles::load(&config_path)
        .with_context(|| format!("loading profiles from {}", config_path.display()))?;
    let info = profiles.profile(&cli.profile)?;
    let handler: Box<dyn FileHandler> = profiles
        .factory()
        .connect(info)
        .await
        .with_context(|| format!("connecting profile '{}'", cli.profile))?;

    match cli.command {
        Commands::Check { path } => {
            let status = handler.can_connect(&path).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("connection: {}", if status.connection_exists { "ok" } else { "failed" });
                println!("folder:     {}", if status.folder_exists { "found" } else { "missing" });
            }
        }
        Commands::Ls { dir, page_size, page_token } => {
            let token = page_token.as_deref().map(parse_page_token);
            let page = handler
                .list(&dir, page_size, token.as_ref())
                .await
                .with_context(|| format!("listing '{}'", dir))?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&page)?);
            } else {
                for entry in &page.entries {
                    print_entry(entry);
                }
                if let Some(next) = page.next_page_token {
                    println!("next page: --page-token {}", next);
                }
            }
        }
        Commands::Lookup { id, name, folder } => {
            let entry = handler
                .file_lookup(id.as_deref(), name.as_deref(), folder.as_deref())
                .await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&entry)?);
            } else {
                print_entry(&entry);
            }
        }
        Commands::Get { remote, local } => match local {
            Some(path) => {
                let mut file = tokio::fs::File::create(&path)
                    .await
                    .with_context(|| format!("creating {}", path.display()))?;
                handler.download_file(&mut file, &remote).await?;
                eprintln!("saved {} to {}", remote, path.display());
            }
            None => {
                let mut stdout = tokio::io::stdout();
                handler.download_file(&mut stdout, &remote).await?;
            }
        },
        Commands::Put { local, destination, name } => {
            let name = match name {
                Some(name) => name,
                None => local
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .context("local path has no file name")?,
            };
            let mut file = tokio::fs::File::open(&local)
                .await
                .with_context(|| format!("opening {}", local.display()))?;
            handler.upload_file(&mut file, &name, &destination).await?;
            eprintln!("uploaded {} as {}", local.display(), name);
        }
        Commands::Mv { source, destination } => {
            handler.move_file(&source, &destination).await?;
        }
        Commands::Mkdir { path } => {
            handler.create_directory(&path).await?;
        }
        Commands::Exists { path } => {
            let exists = handler.path_exists(&path).await?;
            println!("{}", exists);
            if !exists {
                std::process::exit(1);
            }
        }
        Commands::Rm { identifier } => {
            handler.delete_file(&identifier).await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    filehandlers::init_logging(cli.verbose);
    run(cli).await
}

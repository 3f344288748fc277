use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "media-vault")]
#[command(about = "Project media storage with deduplication and playback proxies", long_about = None)]
pub struct Cli {
    /// Project to open before running the command
    #[arg(short, long, global = true, default_value = "default")]
    pub project: String,

    /// Read configuration from this file instead of ./Config.toml
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// More terminal logging; repeat for more detail
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Import files or directories into the project
    Import {
        paths: Vec<PathBuf>,
        /// Copy bytes into the content store instead of linking in place
        #[arg(long)]
        copy: bool,
    },
    /// List the media of the project
    List {
        /// Write CSV to stdout instead of a table
        #[arg(long)]
        csv: bool,
    },
    /// Remove media from the project
    Remove { ids: Vec<String> },
    /// Point a linked media item at a different file
    Relink { id: String, path: PathBuf },
    /// Copy media into another project, sharing stored bytes
    Copy { id: String, target: String },
    /// Add media to another project without copying the record
    Attach { id: String, target: String },
    /// Re-check that every media item in the project is reachable
    Verify,
    /// Check stored content against the catalog
    Fsck {
        /// Remove orphans and stale staging, fix reference counts
        #[arg(long)]
        repair: bool,
        /// Do not ask before repairing
        #[arg(short, long)]
        yes: bool,
    },
    /// Generate a playback proxy and wait for it
    Proxy {
        id: String,
        /// Cancel a running generation instead
        #[arg(long)]
        cancel: bool,
    },
    /// Regenerate thumbnails
    Thumbnails { ids: Vec<String> },
    /// Copy a media item's bytes under exports/
    Export { id: String },
    /// Print catalog and storage statistics
    Stats,
    /// Print the effective configuration as TOML
    Config {
        /// Write it to this file as well
        #[arg(long)]
        write: Option<PathBuf>,
    },
}

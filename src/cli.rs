use clap::{Args, Parser, Subcommand};

use crate::types::{Domain, FileStructure, LogLevel, VersionSize};

#[derive(Parser, Debug)]
#[command(
    name = "icloud-photo-sync",
    version,
    about = "Resumable, checkpointed bulk downloader for iCloud Photos"
)]
pub struct Cli {
    #[command(flatten)]
    pub account: AccountArgs,

    /// Log level (RUST_LOG overrides)
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Command,
}

/// Identity and session location, shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct AccountArgs {
    /// Apple ID email address
    #[arg(short = 'u', long, env = "ICLOUD_USERNAME", global = true)]
    pub username: Option<String>,

    /// iCloud password (if not provided, will prompt).
    /// WARNING: passing via --password is visible in process listings.
    /// Prefer the ICLOUD_PASSWORD environment variable instead.
    #[arg(
        short = 'p',
        long,
        env = "ICLOUD_PASSWORD",
        hide_env_values = true,
        global = true
    )]
    pub password: Option<String>,

    /// Directory for cookies, session data and the checkpoint database
    #[arg(
        long,
        env = "ICLOUD_COOKIE_DIR",
        default_value = "~/.icloud-photo-sync",
        global = true
    )]
    pub cookie_dir: String,

    /// iCloud domain (com or cn)
    #[arg(long, value_enum, default_value = "com", global = true)]
    pub domain: Domain,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Authenticate (completing 2FA if needed) and persist the session
    Auth,

    /// Sync album metadata and download pending assets until stopped
    Download(DownloadArgs),

    /// Show checkpoint counts and pending assets
    Status(StatusArgs),

    /// Upload local files to the photo library
    Upload(UploadArgs),
}

#[derive(Args, Debug, Clone)]
pub struct DownloadArgs {
    /// Local directory for downloads
    #[arg(short = 'o', long)]
    pub output: String,

    /// Album to sync
    #[arg(short = 'a', long, default_value = "All Photos")]
    pub album: String,

    /// Number of concurrent download workers
    #[arg(short = 't', long, default_value_t = 10)]
    pub threads: u16,

    /// Exit after downloading this many assets
    #[arg(long)]
    pub stop_after: Option<u64>,

    /// Start the first album scan at this offset instead of the stored one
    #[arg(long)]
    pub offset: Option<u64>,

    /// Delete local files for assets found in "Recently Deleted"
    #[arg(long)]
    pub auto_delete: bool,

    /// Date folder layout, e.g. "%Y/%m"; "/" or "none" for a flat layout
    #[arg(long, default_value = "%Y/%m")]
    pub folder_structure: String,

    /// Local file naming
    #[arg(long, value_enum, default_value = "id")]
    pub file_structure: FileStructure,

    /// Also download the video of live photos
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub with_live_photo: bool,

    /// Rendition to download
    #[arg(long = "version", value_enum, default_value = "original")]
    pub size: VersionSize,

    /// Scan the album newest first
    #[arg(long)]
    pub newest_first: bool,

    /// Give up after this many failed downloads
    #[arg(long, default_value_t = 20)]
    pub max_failures: u64,

    /// Max retries per download on transient errors
    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,

    /// Stored scan offsets older than this are discarded
    #[arg(long, default_value_t = 12)]
    pub offset_ttl_hours: u64,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    /// List the ids of pending assets
    #[arg(long)]
    pub pending: bool,
}

#[derive(Args, Debug, Clone)]
pub struct UploadArgs {
    /// File to upload (repeatable)
    #[arg(short = 'f', long = "file", required = true)]
    pub files: Vec<String>,
}

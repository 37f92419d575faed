use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::session::sanitize_username;
use crate::cli::{AccountArgs, DownloadArgs};
use crate::download::queue::QueuePolicy;
use crate::download::DownloadConfig;
use crate::icloud::photos::Direction;
use crate::retry::RetryConfig;
use crate::types::Domain;

/// Account-level settings every command needs.
pub struct AccountConfig {
    pub username: String,
    pub password: Option<String>,
    pub cookie_directory: PathBuf,
    pub domain: Domain,
}

impl std::fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountConfig")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("cookie_directory", &self.cookie_directory)
            .field("domain", &self.domain)
            .finish()
    }
}

impl AccountConfig {
    pub fn from_cli(args: AccountArgs) -> anyhow::Result<Self> {
        let username = args
            .username
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .ok_or_else(|| anyhow::anyhow!("--username (or ICLOUD_USERNAME) is required"))?;
        Ok(Self {
            username,
            password: args.password.filter(|p| !p.is_empty()),
            cookie_directory: expand_tilde(&args.cookie_dir),
            domain: args.domain,
        })
    }

    /// `{cookie_dir}/{account}.db`
    pub fn db_path(&self) -> PathBuf {
        self.cookie_directory
            .join(format!("{}.db", sanitize_username(&self.username)))
    }
}

/// Everything the `download` command runs with.
#[derive(Debug)]
pub struct SyncConfig {
    pub album: String,
    pub direction: Direction,
    pub start_offset: Option<u64>,
    pub auto_delete: bool,
    pub offset_ttl: Duration,
    pub download: DownloadConfig,
}

impl SyncConfig {
    pub fn from_cli(args: DownloadArgs) -> anyhow::Result<Self> {
        if args.threads == 0 {
            anyhow::bail!("--threads must be at least 1");
        }
        if args.offset_ttl_hours == 0 {
            anyhow::bail!("--offset-ttl-hours must be at least 1");
        }
        if args.stop_after == Some(0) {
            anyhow::bail!("--stop-after must be at least 1");
        }
        let directory = expand_tilde(&args.output);
        if directory.as_os_str().is_empty() {
            anyhow::bail!("--output must not be empty");
        }

        Ok(Self {
            album: args.album,
            direction: if args.newest_first {
                Direction::Descending
            } else {
                Direction::Ascending
            },
            start_offset: args.offset,
            auto_delete: args.auto_delete,
            offset_ttl: Duration::from_secs(args.offset_ttl_hours * 60 * 60),
            download: DownloadConfig {
                directory,
                folder_structure: args.folder_structure,
                file_structure: args.file_structure,
                size: args.size,
                with_live_photo: args.with_live_photo,
                threads: usize::from(args.threads),
                stop_after: args.stop_after,
                max_failures: args.max_failures,
                retry: RetryConfig {
                    max_retries: args.max_retries,
                    ..RetryConfig::default()
                },
                queue: QueuePolicy::default(),
            },
        })
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    Path::new(path).to_path_buf()
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::cli::{Cli, Command};
    use crate::types::{FileStructure, VersionSize};

    fn download_args(extra: &[&str]) -> (AccountArgs, DownloadArgs) {
        let mut argv = vec!["icloud-photo-sync", "-u", "user@example.com", "download"];
        argv.extend_from_slice(extra);
        let cli = Cli::try_parse_from(argv).unwrap();
        match cli.command {
            Command::Download(args) => (cli.account, args),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_expand_tilde_with_home() {
        let result = expand_tilde("~/Documents");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(result, home.join("Documents"));
        }
    }

    #[test]
    fn test_expand_tilde_no_prefix() {
        assert_eq!(
            expand_tilde("/absolute/path"),
            PathBuf::from("/absolute/path")
        );
        assert_eq!(
            expand_tilde("relative/path"),
            PathBuf::from("relative/path")
        );
    }

    #[test]
    fn test_db_path_uses_sanitized_account() {
        let (account, _) = download_args(&["-o", "/p", "--cookie-dir", "/state"]);
        let account = AccountConfig::from_cli(account).unwrap();
        assert_eq!(account.db_path(), PathBuf::from("/state/userexamplecom.db"));
    }

    #[test]
    fn test_missing_username_rejected() {
        let args = AccountArgs {
            username: None,
            password: None,
            cookie_dir: "/state".into(),
            domain: Domain::Com,
        };
        assert!(AccountConfig::from_cli(args).is_err());
    }

    #[test]
    fn test_password_redacted_in_debug() {
        let args = AccountArgs {
            username: Some("u@example.com".into()),
            password: Some("hunter2".into()),
            cookie_dir: "/state".into(),
            domain: Domain::Com,
        };
        let cfg = AccountConfig::from_cli(args).unwrap();
        assert!(!format!("{cfg:?}").contains("hunter2"));
    }

    #[test]
    fn test_sync_config_from_flags() {
        let (_, args) = download_args(&[
            "-o",
            "/photos",
            "-t",
            "4",
            "--version",
            "medium",
            "--file-structure",
            "name",
            "--newest-first",
            "--offset-ttl-hours",
            "24",
            "--max-retries",
            "5",
        ]);
        let cfg = SyncConfig::from_cli(args).unwrap();
        assert_eq!(cfg.direction, Direction::Descending);
        assert_eq!(cfg.offset_ttl, Duration::from_secs(24 * 3600));
        assert_eq!(cfg.download.directory, PathBuf::from("/photos"));
        assert_eq!(cfg.download.threads, 4);
        assert_eq!(cfg.download.size, VersionSize::Medium);
        assert_eq!(cfg.download.file_structure, FileStructure::Name);
        assert_eq!(cfg.download.retry.max_retries, 5);
        assert_eq!(cfg.download.queue, QueuePolicy::default());
    }

    #[test]
    fn test_zero_threads_rejected() {
        let (_, args) = download_args(&["-o", "/photos", "-t", "0"]);
        assert!(SyncConfig::from_cli(args).is_err());
    }
}

//! icloud-photo-sync: resumable bulk downloader for iCloud Photos.
//!
//! A metadata producer records every asset of an album in a local SQLite
//! checkpoint store; a pool of download workers drains the pending set into
//! a local directory. Both survive restarts: scans resume from the stored
//! offset and finished assets are never fetched twice.

#![warn(clippy::all)]

mod auth;
mod cli;
mod config;
mod download;
mod gateway;
mod icloud;
pub mod retry;
mod shutdown;
mod state;
mod sync;
mod types;

use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use auth::endpoints::Endpoints;
use auth::session::{SessionData, SessionStore, SharedSession};
use auth::{AuthSessionMachine, Credentials, TextProvider};
use cli::{Command, DownloadArgs, StatusArgs, UploadArgs};
use config::{AccountConfig, SyncConfig};
use download::{DownloadError, DownloadScheduler};
use gateway::{HttpGateway, SessionClient};
use icloud::photos::PhotosService;
use state::{CheckpointStore, SqliteCheckpointStore};
use sync::{download_loop, AutoDeleter, Cadence, Producer, Wake};

/// Per-request timeout for API calls; downloads set their own deadline.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Logins attempted while the user keeps mistyping the 2FA code.
const CODE_ATTEMPTS: u32 = 3;

fn password_provider(password: Option<String>) -> TextProvider {
    Arc::new(move |account: &str| -> anyhow::Result<String> {
        match &password {
            Some(p) => Ok(p.clone()),
            None => Ok(rpassword::prompt_password(format!(
                "iCloud password for {account}: "
            ))?),
        }
    })
}

fn two_fa_prompt() -> TextProvider {
    Arc::new(|_account: &str| -> anyhow::Result<String> {
        print!("Enter the 6-digit code sent to your trusted device: ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        Ok(line.trim().to_string())
    })
}

/// Build the HTTP stack for the account and authenticate it. The session
/// file is written by the machine after every successful login.
async fn login(account: &AccountConfig) -> anyhow::Result<(AuthSessionMachine, SessionStore)> {
    let endpoints = Endpoints::for_domain(account.domain);
    let gateway = HttpGateway::new(
        &account.cookie_directory,
        &account.username,
        &endpoints.home,
        REQUEST_TIMEOUT,
    )
    .await?;

    let store = SessionStore::new(&account.cookie_directory, &account.username);
    let session: SharedSession = Arc::new(tokio::sync::RwLock::new(store.load().await));
    let client = SessionClient::new(Arc::new(gateway), session);

    let credentials = Credentials::new(
        account.username.clone(),
        password_provider(account.password.clone()),
        two_fa_prompt(),
    );
    let mut machine =
        AuthSessionMachine::new(client, endpoints, credentials).with_store(store.clone());
    if let Err(e) = machine.authenticate_interactive(CODE_ATTEMPTS).await {
        if e.is_credentials_rejected() {
            tracing::error!("Apple rejected the sign-in; check the username and password");
        } else if e.is_unsupported_two_step() {
            tracing::error!("Enable two-factor authentication on this Apple ID and retry");
        }
        return Err(e.into());
    }
    Ok((machine, store))
}

/// Photos service for the logged-in account.
async fn photos_service(machine: &AuthSessionMachine) -> anyhow::Result<PhotosService> {
    let client = machine.client().clone();
    let client_id = client.session().read().await.client_id.clone().unwrap_or_default();
    let dsid = machine.snapshot().and_then(|s| s.dsid()).map(str::to_string);
    Ok(PhotosService::new(
        client,
        machine.webservice_url("ckdatabasews")?,
        PhotosService::common_params(&client_id, dsid.as_deref()),
    ))
}

async fn run_auth(account: AccountConfig) -> anyhow::Result<()> {
    let (machine, store) = login(&account).await?;
    println!(
        "Authenticated {} (session saved to {})",
        account.username,
        store.path().display()
    );
    tracing::debug!(dsid = ?machine.snapshot().and_then(|s| s.dsid()), "Account snapshot");
    Ok(())
}

async fn run_download(account: AccountConfig, args: DownloadArgs) -> anyhow::Result<()> {
    let sync = SyncConfig::from_cli(args)?;
    tracing::debug!(?account, ?sync, "Resolved configuration");
    let cancel = shutdown::install_signal_handler();

    let (machine, session_store) = login(&account).await?;
    let client = machine.client().clone();
    let service = Arc::new(photos_service(&machine).await?);

    let db_path = account.db_path();
    let store: Arc<dyn CheckpointStore> =
        Arc::new(SqliteCheckpointStore::open(&db_path, sync.offset_ttl).await?);
    tracing::info!(
        db = %db_path.display(),
        output = %sync.download.directory.display(),
        album = %sync.album,
        threads = sync.download.threads,
        "Starting sync"
    );

    let wake = Arc::new(Wake::default());
    let scheduler = Arc::new(DownloadScheduler::new(
        client.clone(),
        store.clone(),
        sync.download.clone(),
    ));
    let producer = Producer::new(service.clone(), sync.album.clone(), store.clone(), wake.clone())
        .with_direction(sync.direction);
    let deleter = sync
        .auto_delete
        .then(|| AutoDeleter::new(service.clone(), store.clone(), Arc::new(sync.download.clone())));

    // Whatever ends the download loop (quota, budget, shutdown) ends the run.
    let loops = cancel.child_token();
    let cadence = Cadence::default();
    let downloads = async {
        let result = download_loop(scheduler.clone(), wake, cadence, loops.clone()).await;
        loops.cancel();
        result
    };
    let auto_delete = async {
        if let Some(deleter) = &deleter {
            deleter.run(cadence, loops.clone()).await;
        }
    };
    let (result, (), ()) = tokio::join!(
        downloads,
        producer.run(sync.start_offset, cadence, loops.clone()),
        auto_delete
    );

    let session = client.session().read().await.clone();
    save_session(&session_store, &session).await;
    tracing::info!(
        transferred = scheduler.transferred(),
        failures = scheduler.failures(),
        "Sync stopped"
    );

    match result {
        Err(e @ DownloadError::BudgetExhausted { .. }) => {
            tracing::error!(error = %e, "Exiting after too many failed downloads");
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
        Ok(()) => Ok(()),
    }
}

async fn save_session(store: &SessionStore, session: &SessionData) {
    if let Err(e) = store.save(session).await {
        tracing::warn!(error = %e, "Failed to save session on shutdown");
    }
}

async fn run_status(account: AccountConfig, args: StatusArgs) -> anyhow::Result<()> {
    let db_path = account.db_path();
    if !db_path.exists() {
        println!("No checkpoint database found at {}", db_path.display());
        println!("Run a download first to create it.");
        return Ok(());
    }

    let store = SqliteCheckpointStore::open(&db_path, state::DEFAULT_OFFSET_TTL).await?;
    let summary = store.summary().await?;

    println!("Checkpoint database: {}", db_path.display());
    println!();
    println!("Assets:");
    println!("  Pending: {}", summary.pending);
    println!("  Done:    {}", summary.done);
    if !summary.offsets.is_empty() {
        println!();
        println!("Scan offsets:");
        for (album, offset) in &summary.offsets {
            println!("  {album}: {offset}");
        }
    }

    if args.pending && summary.pending > 0 {
        println!();
        println!("Pending assets:");
        for asset in store.list_pending().await? {
            println!("  {} ({})", asset.id(), asset.filename(false));
        }
    }
    Ok(())
}

async fn upload_file(service: &PhotosService, file: &str) -> anyhow::Result<()> {
    let path = Path::new(file);
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{file} has no usable file name"))?;
    let body = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {file}"))?;
    let outcome = service
        .upload(filename, body)
        .await
        .with_context(|| format!("Failed to upload {file}"))?;
    if outcome.is_duplicate {
        println!("{filename}: duplicate, already in the library");
    } else {
        println!("{filename}: uploaded");
    }
    Ok(())
}

async fn run_upload(account: AccountConfig, args: UploadArgs) -> anyhow::Result<()> {
    let (machine, session_store) = login(&account).await?;
    let service = photos_service(&machine)
        .await?
        .with_upload_root(machine.webservice_url("uploadimagews")?);

    let mut result = Ok(());
    for file in &args.files {
        result = upload_file(&service, file).await;
        if result.is_err() {
            break;
        }
    }

    let session = machine.client().session().read().await.clone();
    save_session(&session_store, &session).await;
    result
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    let account = AccountConfig::from_cli(cli.account)?;
    match cli.command {
        Command::Auth => run_auth(account).await,
        Command::Download(args) => run_download(account, args).await,
        Command::Status(args) => run_status(account, args).await,
        Command::Upload(args) => run_upload(account, args).await,
    }
}

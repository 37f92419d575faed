use std::fs::FileTimes;
use std::path::Path;
use std::time::{Duration, SystemTime};

use base64::Engine;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::error::DownloadError;
use super::paths::part_path;
use crate::gateway::{GatewayRequest, SessionClient};
use crate::icloud::photos::AssetVersion;
use crate::retry::{self, RetryAction, RetryConfig};

const MIN_STREAM_DEADLINE: Duration = Duration::from_secs(10 * 60);

/// Assumed worst-case throughput when sizing a transfer's deadline.
const MIN_BYTES_PER_SEC: u64 = 100 * 1024;

/// `max(10 min, size at 100 KiB/s)`.
pub fn stream_deadline(size: u64) -> Duration {
    MIN_STREAM_DEADLINE.max(Duration::from_secs(size / MIN_BYTES_PER_SEC))
}

/// Download one rendition to `path` through a `.part` sibling.
///
/// Each attempt deletes any existing `.part` file and downloads from
/// scratch. Length and checksum are verified before the rename, then the
/// file times are set to `modified`. Returns the number of bytes written.
pub async fn download_file(
    client: &SessionClient,
    version: &AssetVersion,
    path: &Path,
    modified: DateTime<Utc>,
    retry_config: &RetryConfig,
) -> Result<u64, DownloadError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let part = part_path(path);

    let written = retry::retry_with_backoff(
        retry_config,
        |e: &DownloadError| {
            if e.is_retryable() {
                RetryAction::Retry
            } else {
                RetryAction::Abort
            }
        },
        || async {
            let _ = fs::remove_file(&part).await;
            attempt_download(client, version, path, &part).await
        },
    )
    .await;

    let written = match written {
        Ok(n) => n,
        Err(e) => {
            let _ = fs::remove_file(&part).await;
            return Err(e);
        }
    };

    let target = path.to_path_buf();
    let stamped = tokio::task::spawn_blocking(move || set_file_times(&target, modified)).await;
    match stamped {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(path = %path.display(), error = %e, "Could not set file times"),
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "File times task failed"),
    }

    Ok(written)
}

async fn attempt_download(
    client: &SessionClient,
    version: &AssetVersion,
    path: &Path,
    part: &Path,
) -> Result<u64, DownloadError> {
    let path_str = path.display().to_string();
    let request = GatewayRequest::get(&version.url)
        .expect(&[200])
        .timeout(stream_deadline(version.size));
    let response = client
        .request_stream(&request)
        .await
        .map_err(|source| DownloadError::Gateway {
            path: path_str.clone(),
            source,
        })?;
    let content_length = response.content_length;

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(part)
        .await?;

    // Incremental SHA256, large videos never sit in memory.
    let mut hasher = Sha256::new();
    let mut bytes_written: u64 = 0;
    let mut stream = response.body;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|source| {
            tracing::warn!(
                path = %path_str,
                content_length,
                bytes_so_far = bytes_written,
                error = %source,
                "Body stream error"
            );
            DownloadError::Gateway {
                path: path_str.clone(),
                source,
            }
        })?;
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
        bytes_written += chunk.len() as u64;
    }
    file.flush().await?;
    drop(file);

    if version.size > 0 && bytes_written != version.size {
        return Err(DownloadError::SizeMismatch {
            path: path_str,
            expected: version.size,
            actual: bytes_written,
        });
    }

    if let Some(checksum) = version.checksum.as_deref() {
        if !checksum_matches(checksum, &hasher.finalize()) {
            return Err(DownloadError::ChecksumMismatch(path_str));
        }
    }

    fs::rename(part, path).await?;
    Ok(bytes_written)
}

/// Apple uses two SHA-256 checksum formats: raw 32 bytes, or 33 bytes with a
/// one-byte type prefix. Anything else is a different digest and is not
/// checked.
fn checksum_matches(checksum: &str, actual: &[u8]) -> bool {
    let Ok(expected) = base64::engine::general_purpose::STANDARD.decode(checksum) else {
        return true;
    };
    match expected.len() {
        32 => actual == expected.as_slice(),
        33 => actual == &expected[1..],
        _ => true,
    }
}

fn set_file_times(path: &Path, modified: DateTime<Utc>) -> std::io::Result<()> {
    let time = SystemTime::from(modified);
    let times = FileTimes::new().set_modified(time).set_accessed(time);
    let file = std::fs::File::options().write(true).open(path)?;
    file.set_times(times)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use super::*;
    use crate::auth::session::SessionData;
    use crate::gateway::testing::{FakeGateway, ScriptedResponse};

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("claude").join("file_tests").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn client(fake: &Arc<FakeGateway>) -> SessionClient {
        let session = Arc::new(tokio::sync::RwLock::new(SessionData::default()));
        SessionClient::new(fake.clone(), session)
    }

    fn quick_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    fn version(body: &[u8], checksum: Option<String>) -> AssetVersion {
        AssetVersion {
            filename: "IMG_1.JPG".into(),
            width: 1,
            height: 1,
            size: body.len() as u64,
            url: "https://cdn.test/img1".into(),
            asset_type: "public.jpeg".into(),
            checksum,
        }
    }

    fn sha_b64(body: &[u8], prefix: Option<u8>) -> String {
        let mut bytes: Vec<u8> = prefix.into_iter().collect();
        bytes.extend_from_slice(&Sha256::digest(body));
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    #[test]
    fn test_stream_deadline() {
        assert_eq!(stream_deadline(0), Duration::from_secs(600));
        assert_eq!(stream_deadline(1024 * 1024 * 1024), Duration::from_secs(10485));
    }

    #[test]
    fn test_checksum_formats() {
        let body = b"hello world";
        let actual = Sha256::digest(body);
        assert!(checksum_matches(&sha_b64(body, None), &actual));
        assert!(checksum_matches(&sha_b64(body, Some(1)), &actual));
        assert!(!checksum_matches(&sha_b64(b"other", None), &actual));
        // Not a SHA-256 digest: unchecked.
        assert!(checksum_matches("AQID", &actual));
    }

    #[tokio::test]
    async fn test_download_writes_file_and_times() {
        let dir = test_dir("writes");
        let body = b"0123456789abcdef-jpeg";
        let fake = Arc::new(FakeGateway::new());
        fake.push("/img1", ScriptedResponse::bytes(200, body));
        let path = dir.join("2024").join("IMG_1.JPG");
        let modified = DateTime::from_timestamp(1_700_000_000, 0).unwrap();

        let n = download_file(
            &client(&fake),
            &version(body, Some(sha_b64(body, Some(1)))),
            &path,
            modified,
            &quick_retry(),
        )
        .await
        .unwrap();

        assert_eq!(n, body.len() as u64);
        assert_eq!(std::fs::read(&path).unwrap(), body);
        assert!(!part_path(&path).exists());
        let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(mtime, SystemTime::from(modified));

        let calls = fake.calls.lock().unwrap();
        assert_eq!(calls[0].timeout, Some(Duration::from_secs(600)));
    }

    #[tokio::test]
    async fn test_timeout_then_success() {
        let dir = test_dir("retry");
        let body = b"payload";
        let fake = Arc::new(FakeGateway::new());
        // The first call is unscripted and times out.
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = calls.clone();
        fake.route(move |_| {
            let n = seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            (n > 0).then(|| ScriptedResponse::bytes(200, b"payload"))
        });
        let path = dir.join("IMG_1.JPG");

        download_file(
            &client(&fake),
            &version(body, None),
            &path,
            Utc::now(),
            &quick_retry(),
        )
        .await
        .unwrap();
        assert_eq!(fake.call_count(), 2);
        assert_eq!(std::fs::read(&path).unwrap(), body);
    }

    #[tokio::test]
    async fn test_truncated_body_retried_then_fails() {
        let dir = test_dir("truncated");
        let fake = Arc::new(FakeGateway::new());
        fake.route(|_| Some(ScriptedResponse::bytes(200, b"short")));
        let path = dir.join("IMG_1.JPG");

        let err = download_file(
            &client(&fake),
            &version(b"much longer body", None),
            &path,
            Utc::now(),
            &quick_retry(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DownloadError::SizeMismatch { actual: 5, .. }));
        assert_eq!(fake.call_count(), 3);
        assert!(!path.exists());
        assert!(!part_path(&path).exists());
    }

    #[tokio::test]
    async fn test_checksum_mismatch_never_renames() {
        let dir = test_dir("checksum");
        let body = b"real bytes";
        let fake = Arc::new(FakeGateway::new());
        fake.route(|_| Some(ScriptedResponse::bytes(200, b"real bytes")));
        let path = dir.join("IMG_1.JPG");

        let err = download_file(
            &client(&fake),
            &version(body, Some(sha_b64(b"other bytes", None))),
            &path,
            Utc::now(),
            &quick_retry(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DownloadError::ChecksumMismatch(_)));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_gone_is_not_retried() {
        let dir = test_dir("gone");
        let fake = Arc::new(FakeGateway::new());
        fake.route(|_| Some(ScriptedResponse::empty(410)));
        let path = dir.join("IMG_1.JPG");

        let err = download_file(
            &client(&fake),
            &version(b"x", None),
            &path,
            Utc::now(),
            &quick_retry(),
        )
        .await
        .unwrap_err();
        assert!(err.is_resource_gone());
        assert_eq!(fake.call_count(), 1);
    }
}

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use image_archiver_core::CandidateItem;
use image_archiver_providers::{FileStore, MessageFeed};
use tokio::time::sleep;
use tracing::{debug, warn};

/// Bounded retry with exponential backoff: `base_delay`, then doubled per failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << shift)
    }

    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, RetryExhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.max_attempts => {
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last_error: e,
                    });
                }
                Err(e) => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        label,
                        attempt,
                        max_attempts = self.max_attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %format!("{e:#}"),
                        "attempt failed, retrying"
                    );
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last_error: anyhow::Error,
}

/// Moves one attachment from the feed to the file store through a scratch file.
pub struct ItemTransfer {
    feed: Arc<dyn MessageFeed>,
    store: Arc<dyn FileStore>,
    scratch_dir: PathBuf,
    folder_id: String,
}

impl ItemTransfer {
    pub fn new(
        feed: Arc<dyn MessageFeed>,
        store: Arc<dyn FileStore>,
        scratch_dir: PathBuf,
        folder_id: impl Into<String>,
    ) -> Self {
        Self {
            feed,
            store,
            scratch_dir,
            folder_id: folder_id.into(),
        }
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Download, upload, clean up. Returns the destination file id.
    ///
    /// The store gets no idempotency key, so a retry after a failed response to a
    /// completed upload leaves a duplicate destination file behind.
    pub async fn transfer(&self, item: &CandidateItem) -> Result<String> {
        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .with_context(|| format!("create scratch dir {}", self.scratch_dir.display()))?;
        let path = self.scratch_path(item);

        let result = self.copy_via(item, &path).await;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(item_id = %item.id, path = %path.display(), error = %e, "failed to remove scratch file");
            }
        }
        result
    }

    async fn copy_via(&self, item: &CandidateItem, path: &Path) -> Result<String> {
        let bytes = self
            .feed
            .download(&item.download_url, path)
            .await
            .with_context(|| format!("download {}", item.id))?;
        debug!(item_id = %item.id, bytes, "downloaded to scratch");

        let uploaded = self
            .store
            .upload(&item.name, &item.mime_type, &self.folder_id, path)
            .await
            .with_context(|| format!("upload {}", item.id))?;
        Ok(uploaded.id)
    }

    fn scratch_path(&self, item: &CandidateItem) -> PathBuf {
        self.scratch_dir.join(scratch_name(item))
    }
}

const MAX_ID_LEN: usize = 128;
const MAX_EXTENSION_LEN: usize = 16;

/// Scratch names come from the item id; the display name only lends a short extension.
/// Display names can exceed the filesystem's name limit and are passed to the store as-is.
fn scratch_name(item: &CandidateItem) -> String {
    let mut name = sanitize(&item.id);
    name.truncate(MAX_ID_LEN);
    if name.is_empty() {
        name.push_str("item");
    }
    let extension = Path::new(&item.name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(sanitize)
        .filter(|ext| !ext.is_empty() && ext.len() <= MAX_EXTENSION_LEN);
    if let Some(ext) = extension {
        name.push('.');
        name.push_str(&ext);
    }
    name
}

fn sanitize(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    cleaned.trim_start_matches('.').to_owned()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn sanitize_keeps_names_path_safe() {
        assert_eq!(sanitize("cat.png"), "cat.png");
        assert_eq!(sanitize("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize("my photo (1).jpg"), "my_photo__1_.jpg");
        assert!(!Path::new(&sanitize("/abs/path")).has_root());
    }

    fn candidate(id: &str, name: &str) -> CandidateItem {
        CandidateItem {
            id: id.to_owned(),
            name: name.to_owned(),
            mime_type: "image/png".to_owned(),
            download_url: format!("mem://{id}"),
        }
    }

    #[test]
    fn scratch_name_ignores_display_name_length() {
        assert_eq!(scratch_name(&candidate("F1", "cat.png")), "F1.png");
        assert_eq!(scratch_name(&candidate("F1", "no extension")), "F1");

        let long = format!("{}.png", "a".repeat(300));
        assert_eq!(scratch_name(&candidate("F1", &long)), "F1.png");

        let weird = format!("photo.{}", "x".repeat(40));
        assert_eq!(scratch_name(&candidate("F1", &weird)), "F1");
        assert!(!scratch_name(&candidate("../..", "a.png")).contains('/'));
        assert!(scratch_name(&candidate(&"F".repeat(400), "a.png")).len() <= 255);
    }

    struct FileFeed;

    #[async_trait::async_trait]
    impl MessageFeed for FileFeed {
        async fn list_page(
            &self,
            _channel_id: &str,
            _cursor: Option<&str>,
            _page_size: u32,
        ) -> Result<image_archiver_providers::HistoryPage> {
            anyhow::bail!("not used")
        }

        async fn download(&self, url: &str, dest: &Path) -> Result<u64> {
            tokio::fs::write(dest, url.as_bytes()).await?;
            Ok(url.len() as u64)
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        names: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl FileStore for RecordingStore {
        async fn upload(
            &self,
            name: &str,
            _mime_type: &str,
            _folder_id: &str,
            source: &Path,
        ) -> Result<image_archiver_providers::UploadedFile> {
            tokio::fs::metadata(source).await?;
            self.names.lock().unwrap().push(name.to_owned());
            Ok(image_archiver_providers::UploadedFile {
                id: "drive-1".to_owned(),
            })
        }
    }

    #[tokio::test]
    async fn transfer_handles_names_longer_than_a_file_name() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(RecordingStore::default());
        let transfer = ItemTransfer::new(
            Arc::new(FileFeed),
            store.clone(),
            tmp.path().join("scratch"),
            "folder-1",
        );
        let long = format!("{}.png", "a".repeat(300));

        let id = transfer.transfer(&candidate("F1", &long)).await.unwrap();
        assert_eq!(id, "drive-1");
        assert_eq!(*store.names.lock().unwrap(), vec![long]);
        let leftovers = std::fs::read_dir(tmp.path().join("scratch")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[tokio::test]
    async fn retry_succeeds_on_third_attempt() {
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let calls = AtomicU32::new(0);
        let value = policy
            .run("flaky", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    anyhow::bail!("attempt {n} failed");
                }
                Ok(n)
            })
            .await
            .unwrap();
        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_attempts() {
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let calls = AtomicU32::new(0);
        let err = policy
            .run("broken", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(anyhow::anyhow!("still broken"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(err.last_error.to_string().contains("still broken"));
    }
}

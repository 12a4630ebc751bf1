//! Configuration for the sync engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tablesync_protocol::{ConflictPolicy, MAX_ALTER_ROWS_BATCH};

/// Which attachment transfer directions a sync pass may perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentPolicy {
    /// Upload and download.
    #[default]
    Sync,
    /// Upload only.
    UploadOnly,
    /// Download only.
    DownloadOnly,
    /// Leave attachments alone.
    None,
}

impl AttachmentPolicy {
    /// Returns true if local files may be sent to the server.
    pub fn allows_upload(&self) -> bool {
        matches!(self, AttachmentPolicy::Sync | AttachmentPolicy::UploadOnly)
    }

    /// Returns true if server files may be fetched.
    pub fn allows_download(&self) -> bool {
        matches!(self, AttachmentPolicy::Sync | AttachmentPolicy::DownloadOnly)
    }

    /// A push pass needs the authoritative manifest and skips the ETag cache.
    pub fn is_push_pass(&self) -> bool {
        self.allows_upload()
    }
}

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Connect timeout for every remote call.
    pub connect_timeout: Duration,
    /// Read timeout for every remote call.
    pub read_timeout: Duration,
    /// Rows per `alterRows` call (capped at 500).
    pub push_batch_size: usize,
    /// Aggregate byte cap for one upload request.
    pub upload_byte_cap: u64,
    /// Rows per changeset page requested from the server.
    pub page_size_hint: usize,
    /// Pull restarts allowed when the data ETag moves mid-pagination.
    pub max_pull_restarts: u32,
    /// Bounds the number of push attempts after 409 responses.
    pub retry: RetryConfig,
    /// Attachment transfer directions.
    pub attachment_policy: AttachmentPolicy,
    /// What to do with conflicts as soon as they are placed.
    pub conflict_policy: ConflictPolicy,
}

impl SyncConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            push_batch_size: MAX_ALTER_ROWS_BATCH,
            upload_byte_cap: 10 * 1024 * 1024,
            page_size_hint: 1000,
            max_pull_restarts: 8,
            retry: RetryConfig::default(),
            attachment_policy: AttachmentPolicy::default(),
            conflict_policy: ConflictPolicy::default(),
        }
    }

    /// Sets the connect and read timeouts.
    pub fn with_timeouts(mut self, connect: Duration, read: Duration) -> Self {
        self.connect_timeout = connect;
        self.read_timeout = read;
        self
    }

    /// Sets the push batch size.
    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size;
        self
    }

    /// Sets the upload byte cap.
    pub fn with_upload_byte_cap(mut self, bytes: u64) -> Self {
        self.upload_byte_cap = bytes;
        self
    }

    /// Sets the page size hint.
    pub fn with_page_size_hint(mut self, rows: usize) -> Self {
        self.page_size_hint = rows;
        self
    }

    /// Sets the pull restart bound.
    pub fn with_max_pull_restarts(mut self, restarts: u32) -> Self {
        self.max_pull_restarts = restarts;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the attachment policy.
    pub fn with_attachment_policy(mut self, policy: AttachmentPolicy) -> Self {
        self.attachment_policy = policy;
        self
    }

    /// Sets the conflict policy.
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Batch size actually used for pushes.
    pub fn effective_push_batch_size(&self) -> usize {
        self.push_batch_size.clamp(1, MAX_ALTER_ROWS_BATCH)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Retries immediately, without sleeping.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::no_retry()
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // up to 25% on top
            Duration::from_secs_f64(delay_secs * (1.0 + 0.25 * jitter_fraction()))
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Cheap pseudo-random fraction in `[0, 1)` taken from the clock.
fn jitter_fraction() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos % 1000) / 1000.0
}

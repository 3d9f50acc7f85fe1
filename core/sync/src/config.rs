//! Configuration for the sync engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use edgesync_peer::PollConfig;

/// Configuration for the facility side of the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// When false, triggers return immediately without syncing.
    pub enabled: bool,
    pub push: PushConfig,
    pub pull: PullConfig,
    pub persist: PersistConfig,
    /// Interval for the periodic trigger, if any.
    pub schedule_interval_secs: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            push: PushConfig::default(),
            pull: PullConfig::default(),
            persist: PersistConfig::default(),
            schedule_interval_secs: None,
        }
    }
}

impl SyncConfig {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_push(mut self, push: PushConfig) -> Self {
        self.push = push;
        self
    }

    pub fn with_pull(mut self, pull: PullConfig) -> Self {
        self.pull = pull;
        self
    }

    pub fn with_persist(mut self, persist: PersistConfig) -> Self {
        self.persist = persist;
        self
    }

    pub fn with_schedule_interval(mut self, interval: Duration) -> Self {
        self.schedule_interval_secs = Some(interval.as_secs());
        self
    }

    /// The periodic trigger interval, if configured.
    pub fn schedule_interval(&self) -> Option<Duration> {
        self.schedule_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Push phase settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// Records per upload request.
    pub chunk_size: usize,
    /// Polling while central persists the pushed changes.
    pub completion_poll: PollConfig,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            completion_poll: PollConfig::default(),
        }
    }
}

impl PushConfig {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_completion_poll(mut self, poll: PollConfig) -> Self {
        self.completion_poll = poll;
        self
    }
}

/// Bounds for adaptive page sizing in paged pulls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageLimitConfig {
    pub initial: usize,
    pub min: usize,
    pub max: usize,
    /// Target duration of one page request.
    pub optimal_page_time_ms: u64,
}

impl Default for PageLimitConfig {
    fn default() -> Self {
        Self {
            initial: 100,
            min: 10,
            max: 10_000,
            optimal_page_time_ms: 2_000,
        }
    }
}

/// Pull phase settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PullConfig {
    pub page: PageLimitConfig,
    /// Records per insert into the incoming snapshot.
    pub persisted_cache_batch_size: usize,
    /// Pause after each insert into the incoming snapshot.
    pub pause_between_cache_batches_ms: u64,
    /// Records buffered from a stream before they are handed to the writer.
    pub stream_flush_batch_size: usize,
    /// Buffered batches the stream reader may run ahead of the writer.
    pub stream_channel_capacity: usize,
    /// Resume attempts after a stream drops before giving up.
    pub max_stream_reconnects: u32,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            page: PageLimitConfig::default(),
            persisted_cache_batch_size: 10_000,
            pause_between_cache_batches_ms: 0,
            stream_flush_batch_size: 1_000,
            stream_channel_capacity: 4,
            max_stream_reconnects: 3,
        }
    }
}

impl PullConfig {
    pub fn with_page(mut self, page: PageLimitConfig) -> Self {
        self.page = page;
        self
    }

    pub fn with_persisted_cache_batch_size(mut self, size: usize) -> Self {
        self.persisted_cache_batch_size = size;
        self
    }

    pub fn with_stream_flush_batch_size(mut self, size: usize) -> Self {
        self.stream_flush_batch_size = size;
        self
    }

    pub fn with_max_stream_reconnects(mut self, reconnects: u32) -> Self {
        self.max_stream_reconnects = reconnects;
        self
    }

    pub fn pause_between_cache_batches(&self) -> Duration {
        Duration::from_millis(self.pause_between_cache_batches_ms)
    }
}

/// Apply phase settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    /// Staged records read and applied per batch.
    pub batch_size: usize,
    /// Pause between batches.
    pub pause_between_batches_ms: u64,
    /// Records written per update chunk.
    pub update_workers: usize,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            pause_between_batches_ms: 0,
            update_workers: 8,
        }
    }
}

impl PersistConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_update_workers(mut self, workers: usize) -> Self {
        self.update_workers = workers;
        self
    }

    pub fn pause_between_batches(&self) -> Duration {
        Duration::from_millis(self.pause_between_batches_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert!(config.enabled);
        assert_eq!(config.push.chunk_size, 500);
        assert_eq!(config.pull.page.initial, 100);
        assert_eq!(config.pull.persisted_cache_batch_size, 10_000);
        assert_eq!(config.persist.update_workers, 8);
        assert_eq!(config.schedule_interval(), None);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: SyncConfig = serde_json::from_str(
            r#"{ "enabled": false, "pull": { "page": { "max": 500 } }, "schedule_interval_secs": 60 }"#,
        )
        .unwrap();
        assert!(!config.enabled);
        assert_eq!(config.pull.page.max, 500);
        assert_eq!(config.pull.page.min, 10);
        assert_eq!(config.push.chunk_size, 500);
        assert_eq!(config.schedule_interval(), Some(Duration::from_secs(60)));
    }
}

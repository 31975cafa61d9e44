use std::time::Duration;

use tracing::warn;

use atlas_core::config::WorkerTuning;

/// Poll intervals below this floor would hammer the database.
const MIN_POLL_INTERVAL_MS: u64 = 200;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub lock_ttl_sec: i64,
    pub worker_id: String,
}

impl WorkerConfig {
    /// Build from settings; the worker identity is `hostname:pid`.
    pub fn from_tuning(tuning: &WorkerTuning) -> Self {
        let mut poll_ms = tuning.poll_interval_ms;
        if poll_ms < MIN_POLL_INTERVAL_MS {
            warn!(
                poll_interval_ms = poll_ms,
                "poll interval below floor, using {MIN_POLL_INTERVAL_MS}ms"
            );
            poll_ms = MIN_POLL_INTERVAL_MS;
        }
        Self {
            enabled: tuning.enabled,
            poll_interval: Duration::from_millis(poll_ms),
            batch_size: tuning.batch_size,
            max_attempts: tuning.max_attempts,
            lock_ttl_sec: tuning.lock_ttl_sec,
            worker_id: default_worker_id(),
        }
    }
}

fn default_worker_id() -> String {
    let hostname = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string());
    format!("{hostname}:{}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_interval_has_a_floor() {
        let tuning = WorkerTuning {
            enabled: true,
            poll_interval_ms: 50,
            batch_size: 10,
            max_attempts: 3,
            lock_ttl_sec: 60,
        };
        let cfg = WorkerConfig::from_tuning(&tuning);
        assert_eq!(cfg.poll_interval, Duration::from_millis(200));
    }

    #[test]
    fn worker_id_contains_pid() {
        let id = default_worker_id();
        assert!(id.contains(':'));
        assert!(id.ends_with(&std::process::id().to_string()));
    }
}

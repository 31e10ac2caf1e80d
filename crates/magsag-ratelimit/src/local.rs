use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::clock::{Clock, SystemClock};
use crate::distributed::{Admission, StoreError, WindowStore};

#[derive(Debug, Default)]
struct WindowLog {
    /// `(timestamp_ms, member)`, oldest first.
    records: VecDeque<(u64, String)>,
    sequence: u64,
}

/// In-process [`WindowStore`].
///
/// The whole check-and-record runs inside one critical section, which gives
/// the same guarantee the Redis script gives across processes: every limiter
/// sharing one `LocalWindowStore` (threads, tasks, or limiter instances)
/// sees a single linear order of decisions per key.
pub struct LocalWindowStore {
    clock: Arc<dyn Clock>,
    logs: Mutex<HashMap<String, WindowLog>>,
}

impl Default for LocalWindowStore {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl LocalWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            logs: Mutex::new(HashMap::new()),
        }
    }

    /// Members currently recorded for `key`, oldest first.
    pub fn members(&self, key: &str) -> Vec<String> {
        self.logs
            .lock()
            .get(key)
            .map(|log| log.records.iter().map(|(_, member)| member.clone()).collect())
            .unwrap_or_default()
    }

    pub fn tracked_keys(&self) -> usize {
        self.logs.lock().len()
    }
}

#[async_trait]
impl WindowStore for LocalWindowStore {
    async fn try_acquire(
        &self,
        key: &str,
        limit: u32,
        window_ms: u64,
    ) -> Result<Admission, StoreError> {
        let now = self.clock.now_ms();
        let cutoff = now.saturating_sub(window_ms);

        let mut logs = self.logs.lock();
        let log = logs.entry(key.to_owned()).or_default();
        log.records.retain(|(ts, _)| *ts > cutoff);

        if log.records.len() < limit as usize {
            log.sequence += 1;
            log.records.push_back((now, format!("{now}-{}", log.sequence)));
            return Ok(Admission {
                granted: true,
                retry_after_ms: None,
            });
        }

        let oldest = log.records.iter().map(|(ts, _)| *ts).min().unwrap_or(now);
        let retry_after_ms = (oldest + window_ms).saturating_sub(now).max(1);
        Ok(Admission {
            granted: false,
            retry_after_ms: Some(retry_after_ms),
        })
    }

    async fn evict_idle(&self, window_ms: u64) -> usize {
        let cutoff = self.clock.now_ms().saturating_sub(window_ms);
        let mut logs = self.logs.lock();
        let before = logs.len();
        logs.retain(|_, log| {
            log.records.retain(|(ts, _)| *ts > cutoff);
            !log.records.is_empty()
        });
        before - logs.len()
    }
}

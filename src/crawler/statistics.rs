use std::time::Duration;

/// Counters for one run. Returned on success and carried by `RunFailure`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub spider: String,
    /// Fetch cycles that produced a page.
    pub pages: usize,
    /// Every request attempt, failed or not.
    pub requests: u32,
    pub retries: u32,
    /// Distinct keys persisted; a key repeated across pages counts once.
    pub items: usize,
    pub batches: usize,
    pub running_time: Duration,
}

impl RunReport {
    pub fn new(spider: impl Into<String>) -> Self {
        Self {
            spider: spider.into(),
            ..Self::default()
        }
    }

    pub(crate) fn record_attempts(&mut self, attempts: u32) {
        self.requests += attempts;
        self.retries += attempts.saturating_sub(1);
    }

    pub fn write_to_log(&self) {
        tracing::info!(
            spider = %self.spider,
            num_pages = self.pages,
            num_requests = self.requests,
            num_retries = self.retries,
            num_items = self.items,
            num_batches = self.batches,
            running_time = ?self.running_time,
            "statistics"
        );
    }
}

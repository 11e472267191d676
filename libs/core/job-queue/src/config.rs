//! Queue configuration
//!
//! This module provides `QueueConfig` for configuring a job queue backend.

use std::time::Duration;

/// Configuration for a job queue
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Queue name, used as metrics label and Redis key prefix
    pub name: String,

    /// Maximum pending + in-flight jobs (0 = unbounded)
    pub max_depth: usize,

    /// How long a dedupe key maps to its first job id
    pub dedupe_window: Duration,

    /// How long delivered/failed jobs stay queryable
    pub retention: Duration,
}

impl QueueConfig {
    /// Create a new QueueConfig with explicit name and default limits
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_depth: 100_000,
            dedupe_window: Duration::from_secs(3600),
            retention: Duration::from_secs(86_400),
        }
    }

    /// Set the maximum queue depth (0 disables the limit)
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Set the dedupe window
    pub fn with_dedupe_window(mut self, window: Duration) -> Self {
        self.dedupe_window = window;
        self
    }

    /// Set how long terminal jobs are retained
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Whether the depth limit is active
    pub fn is_bounded(&self) -> bool {
        self.max_depth > 0
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new("jobs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_pattern() {
        let config = QueueConfig::new("notify")
            .with_max_depth(50)
            .with_dedupe_window(Duration::from_secs(60))
            .with_retention(Duration::from_secs(120));

        assert_eq!(config.name, "notify");
        assert_eq!(config.max_depth, 50);
        assert_eq!(config.dedupe_window, Duration::from_secs(60));
        assert_eq!(config.retention, Duration::from_secs(120));
        assert!(config.is_bounded());
    }

    #[test]
    fn test_unbounded() {
        let config = QueueConfig::default().with_max_depth(0);
        assert!(!config.is_bounded());
    }
}

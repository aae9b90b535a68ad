//! Sliding error-rate breaker.
//!
//! `ErrorsOverTime` keeps the most recent `error_span` failures. Once the window is
//! full, the elapsed time between its oldest and newest entry decides whether the burst
//! is still tolerable: if `error_span` failures happened within `error_threshold`, the
//! caller should stop retrying and surface the failure.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

const BANNER: &str = "----------------------------------------";

/// Aggregate error raised when the window goes out of bounds.
///
/// The message is the caller's prefix followed by every buffered error, each framed by
/// a delimiter banner.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ErrorBurst {
    message: String,
    errors: Vec<String>,
}

impl ErrorBurst {
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Descriptions of the buffered errors, oldest first.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }
}

#[derive(Debug, Clone)]
struct RecordedError {
    at: DateTime<Utc>,
    description: String,
}

/// Sliding window over the most recent errors.
#[derive(Debug, Clone)]
pub struct ErrorsOverTime {
    error_span: usize,
    error_threshold: Duration,
    window: VecDeque<RecordedError>,
    total_errors: u64,
}

impl ErrorsOverTime {
    /// `error_span` is clamped to at least 1.
    pub fn new(error_span: usize, error_threshold: Duration) -> Self {
        let error_span = error_span.max(1);
        Self {
            error_span,
            error_threshold,
            window: VecDeque::with_capacity(error_span),
            total_errors: 0,
        }
    }

    pub fn error_span(&self) -> usize {
        self.error_span
    }

    pub fn error_threshold(&self) -> Duration {
        self.error_threshold
    }

    /// Number of errors currently held in the window.
    pub fn buffered(&self) -> usize {
        self.window.len()
    }

    /// Cumulative number of errors ever recorded.
    pub fn total_errors(&self) -> u64 {
        self.total_errors
    }

    /// Record an error observed now. Returns `true` while still within limits.
    pub fn record_error(&mut self, err: &dyn core::fmt::Display) -> bool {
        self.record_error_at(err, Utc::now())
    }

    /// Record an error observed at `at`. Returns `true` while still within limits.
    pub fn record_error_at(&mut self, err: &dyn core::fmt::Display, at: DateTime<Utc>) -> bool {
        self.window.push_back(RecordedError {
            at,
            description: err.to_string(),
        });
        self.total_errors += 1;

        while self.window.len() > self.error_span {
            self.window.pop_front();
        }

        self.within_limits()
    }

    /// Record an error and fail with an aggregate [`ErrorBurst`] once out of bounds.
    pub fn assert_within_limits(
        &mut self,
        err: &dyn core::fmt::Display,
        prefix: &str,
    ) -> Result<(), ErrorBurst> {
        if self.record_error(err) {
            Ok(())
        } else {
            Err(self.to_burst(prefix))
        }
    }

    /// Build the aggregate error for the current window contents.
    pub fn to_burst(&self, prefix: &str) -> ErrorBurst {
        let errors: Vec<String> = self.window.iter().map(|e| e.description.clone()).collect();

        let mut message = String::from(prefix);
        for description in &errors {
            message.push('\n');
            message.push_str(BANNER);
            message.push('\n');
            message.push_str(description);
        }
        message.push('\n');
        message.push_str(BANNER);

        ErrorBurst { message, errors }
    }

    /// Forget buffered errors (the cumulative counter is kept).
    pub fn reset(&mut self) {
        self.window.clear();
    }

    fn within_limits(&self) -> bool {
        if self.window.len() < self.error_span {
            return true;
        }

        let (Some(oldest), Some(newest)) = (self.window.front(), self.window.back()) else {
            return true;
        };

        let elapsed_ms = (newest.at - oldest.at).num_milliseconds();
        let threshold_ms = i64::try_from(self.error_threshold.as_millis()).unwrap_or(i64::MAX);

        elapsed_ms > threshold_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    #[test]
    fn slow_errors_stay_within_limits() {
        let mut window = ErrorsOverTime::new(3, Duration::from_millis(1000));

        assert!(window.record_error_at(&"a", at(0)));
        assert!(window.record_error_at(&"b", at(500)));
        assert!(window.record_error_at(&"c", at(1600)));
    }

    #[test]
    fn fast_burst_goes_out_of_bounds() {
        let mut window = ErrorsOverTime::new(3, Duration::from_millis(1000));

        assert!(window.record_error_at(&"a", at(0)));
        assert!(window.record_error_at(&"b", at(300)));
        assert!(!window.record_error_at(&"c", at(600)));
    }

    #[test]
    fn elapsed_equal_to_threshold_is_out_of_bounds() {
        let mut window = ErrorsOverTime::new(2, Duration::from_millis(1000));

        assert!(window.record_error_at(&"a", at(0)));
        assert!(!window.record_error_at(&"b", at(1000)));
    }

    #[test]
    fn oldest_entries_are_evicted() {
        let mut window = ErrorsOverTime::new(3, Duration::from_millis(1000));

        window.record_error_at(&"a", at(0));
        window.record_error_at(&"b", at(300));
        window.record_error_at(&"c", at(2000));
        // window is now [b@300, c@2000, d@2100]: 1800ms > 1000ms
        assert!(window.record_error_at(&"d", at(2100)));
        assert_eq!(window.buffered(), 3);
        assert_eq!(window.total_errors(), 4);
    }

    #[test]
    fn burst_message_frames_every_buffered_error() {
        let mut window = ErrorsOverTime::new(2, Duration::from_secs(60));

        assert!(window.assert_within_limits(&"first", "tail failed").is_ok());
        let burst = window
            .assert_within_limits(&"second", "tail failed")
            .unwrap_err();

        assert!(burst.message().starts_with("tail failed"));
        assert!(burst.message().contains("first"));
        assert!(burst.message().contains("second"));
        assert_eq!(burst.message().matches(BANNER).count(), 3);
        assert_eq!(burst.errors(), &["first".to_string(), "second".to_string()]);
    }

    proptest! {
        #[test]
        fn window_never_exceeds_span(span in 1usize..8, offsets in proptest::collection::vec(0i64..5000, 0..40)) {
            let mut window = ErrorsOverTime::new(span, Duration::from_millis(1000));
            let mut t = 0;
            for (i, offset) in offsets.iter().enumerate() {
                t += offset;
                window.record_error_at(&i, at(t));
                prop_assert!(window.buffered() <= span);
            }
            prop_assert_eq!(window.total_errors(), offsets.len() as u64);
        }
    }
}

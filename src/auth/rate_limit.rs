use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub const OTP_BUCKET: &str = "otp_request";
pub const API_BUCKET: &str = "api_request";

#[derive(Debug)]
struct RequestWindow {
    timestamps: Vec<DateTime<Utc>>,
    window_size: Duration,
}

impl RequestWindow {
    fn new(window_size: Duration) -> Self {
        Self {
            timestamps: Vec::new(),
            window_size,
        }
    }

    fn cleanup_old_requests(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.window_size;
        self.timestamps.retain(|ts| *ts > cutoff);
    }
}

/// Sliding-window counters keyed by (key, bucket).
///
/// Buckets are independent: exhausting `otp_request` for a phone number does
/// not consume any of the `api_request` quota for the same key.
#[derive(Clone, Default)]
pub struct RateLimiter {
    windows: Arc<RwLock<HashMap<(String, String), RequestWindow>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts the call and reports whether it is within `limit` calls per window.
    pub async fn check_rate_limit(&self, key: &str, bucket: &str, limit: u32, window_secs: i64) -> bool {
        let now = Utc::now();
        let mut windows = self.windows.write().await;

        let window = windows
            .entry((key.to_string(), bucket.to_string()))
            .or_insert_with(|| RequestWindow::new(Duration::seconds(window_secs)));
        window.window_size = Duration::seconds(window_secs);
        window.cleanup_old_requests(now);

        if window.timestamps.len() < limit as usize {
            window.timestamps.push(now);
            true
        } else {
            false
        }
    }

    /// Drops windows with no requests left in them.
    pub async fn cleanup(&self) {
        let now = Utc::now();
        let mut windows = self.windows.write().await;
        windows.retain(|_, window| {
            window.cleanup_old_requests(now);
            !window.timestamps.is_empty()
        });
    }

    pub async fn tracked_keys(&self) -> usize {
        self.windows.read().await.len()
    }
}

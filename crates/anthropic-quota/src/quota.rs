//! Quota snapshots parsed from Anthropic rate-limit response headers
//!
//! Every messages response carries the unified subscription limits in
//! `anthropic-ratelimit-unified-*` headers. Utilizations are fractions of
//! the rolling 5-hour and 7-day budgets and may exceed 1.0 once a window is
//! overdrawn. Missing or unparseable numbers never fail the probe: the
//! utilizations fall back to 0 and the optional fields stay absent.

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use serde::Serialize;

/// Header prefix shared by all unified rate-limit headers.
pub const HEADER_PREFIX: &str = "anthropic-ratelimit-unified-";

pub const UTILIZATION_5H_HEADER: &str = "anthropic-ratelimit-unified-5h-utilization";
pub const UTILIZATION_7D_HEADER: &str = "anthropic-ratelimit-unified-7d-utilization";
pub const RESET_5H_HEADER: &str = "anthropic-ratelimit-unified-5h-reset";
pub const STATUS_HEADER: &str = "anthropic-ratelimit-unified-status";
pub const REPRESENTATIVE_CLAIM_HEADER: &str = "anthropic-ratelimit-unified-representative-claim";
pub const FALLBACK_PERCENTAGE_HEADER: &str = "anthropic-ratelimit-unified-fallback-percentage";

/// Length of the short rolling window.
pub const FIVE_HOUR_WINDOW_SECS: i64 = 5 * 60 * 60;

/// 5h utilization at which the snapshot is considered critical.
pub const CRITICAL_UTILIZATION: f64 = 0.80;

/// One successful probe's view of the subscription limits.
///
/// Built once per probe and replaced wholesale by the next one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaInfo {
    /// Fraction of the rolling 5-hour budget consumed (may exceed 1.0)
    pub utilization_5h: f64,
    /// Fraction of the rolling 7-day budget consumed
    pub utilization_7d: f64,
    /// Server-reported gate state ("allowed", "allowed_warning", "rejected")
    pub status: Option<String>,
    /// Opaque diagnostic token, passed through unchanged
    pub representative_claim: Option<String>,
    /// Auxiliary budget fraction, only meaningful when > 0
    pub fallback_percentage: Option<f64>,
    /// When the 5h window rolls over, if the server said so
    pub reset_at: Option<DateTime<Utc>>,
}

impl QuotaInfo {
    /// Parse quota headers from a successful response.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            utilization_5h: float_header(headers, UTILIZATION_5H_HEADER).unwrap_or(0.0),
            utilization_7d: float_header(headers, UTILIZATION_7D_HEADER).unwrap_or(0.0),
            status: string_header(headers, STATUS_HEADER),
            representative_claim: string_header(headers, REPRESENTATIVE_CLAIM_HEADER),
            fallback_percentage: float_header(headers, FALLBACK_PERCENTAGE_HEADER),
            reset_at: float_header(headers, RESET_5H_HEADER).and_then(epoch_to_datetime),
        }
    }

    /// 5h utilization as a whole percentage, clamped at 100.
    pub fn percent_used(&self) -> u8 {
        percent(self.utilization_5h)
    }

    /// 7d utilization as a whole percentage, clamped at 100.
    pub fn percent_used_7d(&self) -> u8 {
        percent(self.utilization_7d)
    }

    /// Fallback budget fraction, only when the server reports a positive one.
    pub fn fallback_available(&self) -> Option<f64> {
        self.fallback_percentage.filter(|f| *f > 0.0)
    }

    pub fn is_critical(&self) -> bool {
        self.utilization_5h >= CRITICAL_UTILIZATION
    }

    /// Human-readable time until the 5h window gives capacity back.
    ///
    /// Uses the server's reset timestamp when present. Otherwise assumes
    /// usage ages out uniformly over the window and estimates
    /// `min(utilization, 1) * 5h`; this is an approximation, the server
    /// makes no such promise.
    pub fn time_until_relief_at(&self, now: DateTime<Utc>) -> String {
        let remaining_secs = match self.reset_at {
            Some(reset) => (reset - now).num_seconds(),
            None => (self.utilization_5h.min(1.0) * FIVE_HOUR_WINDOW_SECS as f64).round() as i64,
        };
        format_remaining(remaining_secs)
    }

    pub fn time_until_relief(&self) -> String {
        self.time_until_relief_at(Utc::now())
    }

    /// Compact status line, e.g. `42% | 1h05m`.
    pub fn status_line_at(&self, now: DateTime<Utc>) -> String {
        format!("{}% | {}", self.percent_used(), self.time_until_relief_at(now))
    }

    pub fn status_line(&self) -> String {
        self.status_line_at(Utc::now())
    }
}

fn percent(utilization: f64) -> u8 {
    (utilization * 100.0).round().clamp(0.0, 100.0) as u8
}

/// `1h05m` when at least an hour remains, `42m` below that, `0m` once passed.
pub fn format_remaining(secs: i64) -> String {
    if secs <= 0 {
        return "0m".to_string();
    }
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    if hours > 0 {
        format!("{hours}h{minutes:02}m")
    } else {
        format!("{minutes}m")
    }
}

fn string_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Parse a numeric header. Malformed, negative, or non-finite text counts
/// as absent.
fn float_header(headers: &HeaderMap, name: &str) -> Option<f64> {
    string_header(headers, name)
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
}

fn epoch_to_datetime(secs: f64) -> Option<DateTime<Utc>> {
    let whole = secs.trunc() as i64;
    let nanos = ((secs - secs.trunc()) * 1e9) as u32;
    DateTime::from_timestamp(whole, nanos)
}

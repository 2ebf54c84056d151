//! Shared retry arithmetic for the outbound HTTP clients.

use std::time::{Duration, SystemTime};

/// Statuses worth retrying on top of plain transport errors.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 425 | 429 | 500 | 502 | 503 | 504)
}

/// `min(base * 2^attempt, max)` exponential backoff.
pub fn backoff_delay(base_seconds: f64, attempt: u32, max_seconds: f64) -> Duration {
    let base = base_seconds.max(0.1);
    let max = max_seconds.max(1.0);
    let factor = 2_f64.powi(attempt.min(32) as i32);
    Duration::from_secs_f64((base * factor).min(max))
}

/// Parse a `Retry-After` header value: either delta seconds or an HTTP-date.
/// Dates already in the past collapse to zero.
pub fn parse_retry_after_seconds(raw_value: &str) -> Option<u64> {
    let value = raw_value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    let retry_at = httpdate::parse_http_date(value).ok()?;
    match retry_at.duration_since(SystemTime::now()) {
        Ok(delta) => Some(delta.as_secs()),
        Err(_) => Some(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn retryable_statuses() {
        for status in [408, 425, 429, 500, 502, 503, 504] {
            assert!(is_retryable_status(status), "{status} should be retryable");
        }
        for status in [200, 204, 400, 401, 403, 404, 409, 413, 422] {
            assert!(!is_retryable_status(status), "{status} should not retry");
        }
    }

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff_delay(30.0, 0, 300.0), Duration::from_secs(30));
        assert_eq!(backoff_delay(30.0, 1, 300.0), Duration::from_secs(60));
        assert_eq!(backoff_delay(30.0, 10, 300.0), Duration::from_secs(300));
    }

    #[test]
    fn retry_after_integer_seconds() {
        assert_eq!(parse_retry_after_seconds("75"), Some(75));
        assert_eq!(parse_retry_after_seconds(" 75 "), Some(75));
    }

    #[test]
    fn retry_after_http_date() {
        let future = SystemTime::now() + Duration::from_secs(90);
        let value = httpdate::fmt_http_date(future);
        let parsed = parse_retry_after_seconds(&value).unwrap();
        assert!((85..=90).contains(&parsed), "parsed {parsed}");
    }

    #[test]
    fn retry_after_past_date_is_zero() {
        let past = SystemTime::now() - Duration::from_secs(90);
        let value = httpdate::fmt_http_date(past);
        assert_eq!(parse_retry_after_seconds(&value), Some(0));
    }

    #[test]
    fn retry_after_garbage_is_none() {
        assert_eq!(parse_retry_after_seconds("soon"), None);
        assert_eq!(parse_retry_after_seconds(""), None);
    }
}

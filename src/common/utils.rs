//! Utility functions for shardmeta

use crate::common::error::RetryPolicy;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Parse duration string (e.g., "30s", "5m", "1h", "7d")
pub fn parse_duration(s: &str) -> crate::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else {
        s.split_at(s.len() - s.chars().last().map_or(0, char::len_utf8))
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let duration = match unit {
        "ms" => Duration::from_millis(num),
        "s" => Duration::from_secs(num),
        "m" => Duration::from_secs(num * 60),
        "h" => Duration::from_secs(num * 3600),
        "d" => Duration::from_secs(num * 86400),
        _ => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };

    Ok(duration)
}

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Convert a Duration to whole milliseconds, saturating.
pub fn duration_millis(d: Duration) -> u64 {
    d.as_millis().min(u128::from(u64::MAX)) as u64
}

/// Retry with exponential backoff.
///
/// Only errors whose policy is [`RetryPolicy::Backoff`] are retried. When the
/// budget runs out on such an error the caller gets `OperationTimedOut`.
pub async fn retry_with_backoff<F, Fut, T>(
    what: &str,
    mut f: F,
    max_retries: usize,
    initial_delay: Duration,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::Result<T>>,
{
    let mut delay = initial_delay;
    let attempts = max_retries.max(1);

    for attempt in 0..attempts {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.kind().retry_policy() == RetryPolicy::Backoff => {
                if attempt + 1 == attempts {
                    return Err(crate::Error::OperationTimedOut(format!(
                        "{} gave up after {} attempt(s): {}",
                        what, attempts, e
                    )));
                }
                let jitter = Duration::from_millis(rand::random::<u64>() % 10);
                tracing::warn!(
                    "Retry attempt {} of {} failed: {}, retrying in {:?}",
                    attempt + 1,
                    what,
                    e,
                    delay
                );
                tokio::time::sleep(delay + jitter).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }

    Err(crate::Error::Internal("Max retries exceeded".into()))
}

/// Generate a unique migration ID
pub fn generate_migration_id() -> String {
    format!("mig-{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(604800));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10x").is_err());
    }

    #[tokio::test]
    async fn test_retry_exhaustion_becomes_timeout() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result: crate::Result<()> = retry_with_backoff(
            "refresh",
            || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(crate::Error::MetadataUnavailable("down".into()))
                }
            },
            3,
            Duration::from_millis(1),
        )
        .await;

        assert!(matches!(result, Err(crate::Error::OperationTimedOut(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_does_not_repeat_surface_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result: crate::Result<()> = retry_with_backoff(
            "move",
            || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(crate::Error::ShardNotFound("shard9".into()))
                }
            },
            5,
            Duration::from_millis(1),
        )
        .await;

        assert!(matches!(result, Err(crate::Error::ShardNotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result = retry_with_backoff(
            "refresh",
            || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(crate::Error::MetadataUnavailable("down".into()))
                    } else {
                        Ok(7)
                    }
                }
            },
            5,
            Duration::from_millis(1),
        )
        .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn test_generate_migration_id() {
        let id1 = generate_migration_id();
        let id2 = generate_migration_id();
        assert_ne!(id1, id2);
        assert!(id1.starts_with("mig-"));
    }
}

//! Redis connection helpers shared by the queue and the locker.

use redis::aio::ConnectionManager;

use crate::error::QueueError;

/// Connects to Redis and wraps the client in a `ConnectionManager`.
///
/// The manager reconnects on its own; clone it freely, clones share the
/// underlying multiplexed connection.
///
/// # Errors
///
/// Returns `QueueError::ConnectionFailed` if the URL is invalid or the
/// initial connection fails.
pub async fn connect(redis_url: &str) -> Result<ConnectionManager, QueueError> {
    let client =
        redis::Client::open(redis_url).map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

    ConnectionManager::new(client)
        .await
        .map_err(|e| QueueError::ConnectionFailed(e.to_string()))
}

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_is_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000);
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let Err(err) = connect("not-a-url").await else {
            panic!("invalid url should fail");
        };
        assert!(matches!(err, QueueError::ConnectionFailed(_)));
    }
}

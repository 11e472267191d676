//! Redis connection with startup retry.

use redis::Client;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::{info, warn};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Open a connection manager and verify it with PING.
pub async fn connect(url: &str) -> redis::RedisResult<ConnectionManager> {
    let client = Client::open(url)?;
    let manager = ConnectionManager::new(client).await?;

    let mut conn = manager.clone();
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;

    info!("Successfully connected to Redis");
    Ok(manager)
}

/// `connect`, retried with exponential backoff. `retries` counts attempts
/// after the first.
pub async fn connect_with_retry(url: &str, retries: u32) -> redis::RedisResult<ConnectionManager> {
    let mut attempt = 0;
    loop {
        match connect(url).await {
            Ok(manager) => return Ok(manager),
            Err(e) if attempt < retries => {
                let delay = retry_delay(attempt);
                attempt += 1;
                warn!(
                    error = %e,
                    attempt,
                    retries,
                    delay_ms = delay.as_millis() as u64,
                    "Redis connection failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn retry_delay(attempt: u32) -> Duration {
    Duration::from_millis(500)
        .saturating_mul(1u32 << attempt.min(8))
        .min(MAX_RETRY_DELAY)
}

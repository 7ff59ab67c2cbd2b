use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::Mutex;

use crate::error::{AppError, AppResult};

/// Sliding-window limiter used when the shared counter store is unreachable.
pub struct InMemoryRateLimiter {
    limit_per_minute: u32,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl InMemoryRateLimiter {
    pub fn new(limit_per_minute: u32) -> Self {
        Self {
            limit_per_minute,
            hits: Mutex::new(HashMap::new()),
        }
    }

    pub async fn check(&self, key: &str) -> AppResult<()> {
        let now = Instant::now();
        let window = Duration::from_secs(60);
        let mut hits = self.hits.lock().await;
        let bucket = hits.entry(key.to_string()).or_default();
        while let Some(front) = bucket.front() {
            if now.duration_since(*front) > window {
                bucket.pop_front();
            } else {
                break;
            }
        }
        if bucket.len() as u32 >= self.limit_per_minute {
            return Err(AppError::RateLimited);
        }
        bucket.push_back(now);
        Ok(())
    }
}

/// Signup limiter backed by per-minute redis counters with an in-memory
/// fallback so signups keep working while the bus is down.
pub struct SignupRateLimiter {
    redis_url: String,
    limit_per_minute: u32,
    prefix: String,
    conn: Mutex<Option<MultiplexedConnection>>,
    fallback: InMemoryRateLimiter,
}

impl SignupRateLimiter {
    pub fn new(redis_url: &str, limit_per_minute: u32) -> Self {
        Self {
            redis_url: redis_url.to_string(),
            limit_per_minute,
            prefix: "ratelimit:signup".to_string(),
            conn: Mutex::new(None),
            fallback: InMemoryRateLimiter::new(limit_per_minute),
        }
    }

    pub async fn start(&self) {
        let mut guard = self.conn.lock().await;
        *guard = self.connect().await;
    }

    pub async fn stop(&self) {
        let mut guard = self.conn.lock().await;
        *guard = None;
    }

    async fn connect(&self) -> Option<MultiplexedConnection> {
        let client = match redis::Client::open(self.redis_url.as_str()) {
            Ok(client) => client,
            Err(err) => {
                tracing::warn!(?err, "signup limiter redis url rejected");
                return None;
            }
        };
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => Some(conn),
            Err(err) => {
                tracing::warn!(?err, "signup limiter redis connect failed");
                None
            }
        }
    }

    pub async fn check(&self, key: &str) -> AppResult<()> {
        let mut guard = self.conn.lock().await;
        let Some(conn) = guard.as_mut() else {
            drop(guard);
            return self.fallback.check(key).await;
        };

        let minute = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() / 60)
            .unwrap_or(0);
        let redis_key = format!("{}:{minute}:{key}", self.prefix);

        let count: Result<i64, redis::RedisError> = conn.incr(&redis_key, 1).await;
        match count {
            Ok(count) => {
                if count == 1 {
                    let _: Result<(), redis::RedisError> = conn.expire(&redis_key, 130).await;
                }
                if count > i64::from(self.limit_per_minute) {
                    return Err(AppError::RateLimited);
                }
                Ok(())
            }
            Err(err) => {
                tracing::warn!(?err, "signup limiter redis incr failed; using fallback");
                *guard = None;
                drop(guard);
                self.fallback.check(key).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_limiter_blocks_over_limit() {
        let limiter = InMemoryRateLimiter::new(3);
        for _ in 0..3 {
            limiter.check("1.2.3.4").await.unwrap();
        }
        let err = limiter.check("1.2.3.4").await.unwrap_err();
        assert_eq!(err.code(), "rate_limit_exceeded");
        // Other clients keep their own window.
        limiter.check("5.6.7.8").await.unwrap();
    }

    #[tokio::test]
    async fn signup_limiter_falls_back_without_redis() {
        let limiter = SignupRateLimiter::new("redis://127.0.0.1:1/0", 2);
        limiter.check("client").await.unwrap();
        limiter.check("client").await.unwrap();
        assert!(limiter.check("client").await.is_err());
    }
}

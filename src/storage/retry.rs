//! 远程请求重试（指数退避 + 随机抖动）

use crate::error::SyncResult;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// 重试策略
///
/// 第 n 次失败（从 0 开始）后等待 `2^n * base_delay` 加上不超过 `max_jitter` 的随机抖动。
/// 只有 [`SyncError::is_retryable`](crate::error::SyncError::is_retryable) 的错误会重试。
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 总尝试次数（含第一次）
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_jitter: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// 测试用：几乎不等待
    pub fn fast() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_jitter: Duration::ZERO,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let backoff = self.base_delay.saturating_mul(2u32.saturating_pow(attempt));
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        backoff + jitter
    }

    /// 执行操作，遇到可重试错误时退避后重试
    pub async fn run<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(val) => {
                    if attempt > 0 {
                        info!("{} 在重试 {} 次后成功", operation_name, attempt);
                    }
                    return Ok(val);
                }
                Err(err) if err.is_retryable() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{} 失败 (第 {} 次): {}，{:?} 后重试",
                        operation_name,
                        attempt + 1,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn http(status: u16) -> SyncError {
        SyncError::Http {
            status,
            message: String::new(),
        }
    }

    #[test]
    fn test_delay_grows_exponentially() {
        let policy = RetryPolicy {
            max_jitter: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for(1), Duration::from_millis(400));
        assert_eq!(policy.delay_for(2), Duration::from_millis(800));

        let jittered = RetryPolicy::default().delay_for(1);
        assert!(jittered >= Duration::from_millis(400) && jittered <= Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = RetryPolicy::fast()
            .run("op", || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(http(503))
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: SyncResult<()> = RetryPolicy::fast()
            .run("op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(http(500))
            })
            .await;
        assert_eq!(result.unwrap_err().status(), Some(500));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_client_errors() {
        let calls = AtomicU32::new(0);
        let result: SyncResult<()> = RetryPolicy::fast()
            .run("op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(http(403))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

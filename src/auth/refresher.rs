//! Background token refresh loop.
//!
//! The refresher issues a first token synchronously so the owner has a
//! password in hand for the next connection attempt, then keeps a fresh one
//! available by re-issuing ahead of expiry. The loop is owned exclusively
//! by the transport handler and stopped on close.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::auth::sas::{SasToken, SasTokenSource};
use crate::error::IotHubResult;

/// Delay before re-trying a failed issue.
const ISSUE_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Keeps a current SAS token available ahead of expiry.
#[derive(Debug)]
pub struct TokenRefresher {
    current: Arc<Mutex<SasToken>>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl TokenRefresher {
    /// Issue the first token and start the refresh loop.
    pub fn start(source: Arc<dyn SasTokenSource>, audience: String) -> IotHubResult<Self> {
        let first = source.issue(&audience, Utc::now())?;
        let current = Arc::new(Mutex::new(first));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(Self::run_loop(
            source,
            audience,
            current.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            current,
            cancel,
            handle: Some(handle),
        })
    }

    async fn run_loop(
        source: Arc<dyn SasTokenSource>,
        audience: String,
        current: Arc<Mutex<SasToken>>,
        cancel: CancellationToken,
    ) {
        loop {
            let refresh_on = current.lock().refresh_on;
            match refresh_on {
                Some(at) => {
                    let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                // Externally managed token: nothing to refresh, just wait
                // for the owner to stop us.
                None => {
                    cancel.cancelled().await;
                    break;
                }
            }

            match source.issue(&audience, Utc::now()) {
                Ok(token) => {
                    debug!(audience = %audience, expires_on = %token.expires_on, "Issued fresh SAS token");
                    *current.lock() = token;
                }
                Err(e) => {
                    warn!(audience = %audience, error = %e, "Token refresh failed; retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(ISSUE_RETRY_DELAY) => {}
                    }
                }
            }
        }
        debug!(audience = %audience, "Token refresh loop stopped");
    }

    /// The password to present on the next connection attempt.
    pub fn current_password(&self) -> String {
        self.current.lock().token.clone()
    }

    /// Current token including its schedule.
    pub fn current_token(&self) -> SasToken {
        self.current.lock().clone()
    }

    /// Stop the loop and wait for it to exit.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for TokenRefresher {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, IotHubError};
    use chrono::{DateTime, Duration as ChronoDuration};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingSource {
        issued: AtomicU32,
        ttl: ChronoDuration,
        fail_attempts: u32,
    }

    impl CountingSource {
        fn new(ttl: ChronoDuration) -> Self {
            Self {
                issued: AtomicU32::new(0),
                ttl,
                fail_attempts: 0,
            }
        }
    }

    impl SasTokenSource for CountingSource {
        fn issue(&self, _audience: &str, now: DateTime<Utc>) -> IotHubResult<SasToken> {
            let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
            if n > 1 && n <= self.fail_attempts + 1 {
                return Err(IotHubError::network("signing endpoint unreachable"));
            }
            let expires_on = now + self.ttl;
            Ok(SasToken {
                token: format!("token-{n}"),
                expires_on,
                refresh_on: Some(expires_on - self.ttl / 2),
            })
        }
    }

    #[tokio::test]
    async fn first_token_is_available_immediately() {
        let source = Arc::new(CountingSource::new(ChronoDuration::hours(1)));
        let mut refresher = TokenRefresher::start(source.clone(), "aud".to_string()).unwrap();

        assert_eq!(refresher.current_password(), "token-1");
        assert_eq!(source.issued.load(Ordering::SeqCst), 1);
        refresher.stop().await;
    }

    #[tokio::test]
    async fn start_fails_when_the_first_issue_fails() {
        struct FailingSource;
        impl SasTokenSource for FailingSource {
            fn issue(&self, _: &str, _: DateTime<Utc>) -> IotHubResult<SasToken> {
                Err(IotHubError::new(ErrorKind::ArgumentInvalid, "bad key"))
            }
        }

        let result = TokenRefresher::start(Arc::new(FailingSource), "aud".to_string());
        assert_eq!(result.unwrap_err().kind(), ErrorKind::ArgumentInvalid);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_reissues_when_refresh_time_arrives() {
        let source = Arc::new(CountingSource::new(ChronoDuration::seconds(60)));
        let mut refresher = TokenRefresher::start(source.clone(), "aud".to_string()).unwrap();
        assert_eq!(refresher.current_password(), "token-1");

        // refresh_on is 30s after issue; step past it.
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(refresher.current_password(), "token-2");

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(refresher.current_password(), "token-3");
        refresher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn transient_issue_failures_are_retried() {
        let source = Arc::new(CountingSource {
            issued: AtomicU32::new(0),
            ttl: ChronoDuration::seconds(60),
            fail_attempts: 2,
        });
        let mut refresher = TokenRefresher::start(source.clone(), "aud".to_string()).unwrap();

        // First refresh attempt fails, then the retry fails, then the next
        // retry succeeds: 30s to refresh_on + two 10s retry delays.
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(refresher.current_password(), "token-1");
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(refresher.current_password(), "token-4");
        refresher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_terminates_the_loop_without_error() {
        let source = Arc::new(CountingSource::new(ChronoDuration::seconds(60)));
        let mut refresher = TokenRefresher::start(source.clone(), "aud".to_string()).unwrap();
        refresher.stop().await;

        // No further issues after stop, no matter how much time passes.
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(source.issued.load(Ordering::SeqCst), 1);
    }
}

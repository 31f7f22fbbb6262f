//! Credential refresh with single-flight coordination.
//!
//! A 401 means the bearer credential expired. The refresh handshake is
//! delegated to an external [`CredentialRefresher`]; the [`RefreshGuard`]
//! guarantees at most one refresh call is in flight at a time, with every
//! concurrent 401 handler awaiting that one call's outcome instead of
//! issuing its own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use log::{info, warn};
use tokio::sync::Mutex;

/// External collaborator that exchanges whatever long-lived material it
/// holds for a fresh bearer credential.
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh(&self) -> anyhow::Result<String>;
}

/// The shared future's output must be `Clone`, so the error side is the
/// refresher's message rather than the error itself.
type RefreshOutcome = Result<String, String>;
type RefreshFuture = Shared<BoxFuture<'static, RefreshOutcome>>;

struct Inflight {
    generation: u64,
    future: RefreshFuture,
}

/// At most one in-flight refresh, shared across concurrent streams.
#[derive(Default)]
pub(crate) struct RefreshGuard {
    inflight: Mutex<Option<Inflight>>,
    generations: AtomicU64,
}

impl RefreshGuard {
    pub fn new() -> Self {
        RefreshGuard::default()
    }

    /// Join the in-flight refresh if one exists, otherwise start one.
    pub async fn refresh(&self, refresher: Arc<dyn CredentialRefresher>) -> RefreshOutcome {
        let (generation, future) = {
            let mut slot = self.inflight.lock().await;
            match slot.as_ref() {
                Some(inflight) => {
                    info!("credential refresh already in flight, awaiting its outcome");
                    (inflight.generation, inflight.future.clone())
                }
                None => {
                    let generation = self.generations.fetch_add(1, Ordering::Relaxed);
                    let future = async move {
                        refresher.refresh().await.map_err(|err| {
                            warn!("credential refresh failed: {err:#}");
                            err.to_string()
                        })
                    }
                    .boxed()
                    .shared();
                    *slot = Some(Inflight {
                        generation,
                        future: future.clone(),
                    });
                    (generation, future)
                }
            }
        };

        let outcome = future.await;

        // Clear the slot only if it still holds our refresh; a newer one may
        // already have started.
        let mut slot = self.inflight.lock().await;
        if slot.as_ref().is_some_and(|i| i.generation == generation) {
            *slot = None;
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingRefresher {
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl CredentialRefresher for CountingRefresher {
        async fn refresh(&self) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok("fresh-credential".to_string())
        }
    }

    struct FailingRefresher;

    #[async_trait]
    impl CredentialRefresher for FailingRefresher {
        async fn refresh(&self) -> anyhow::Result<String> {
            anyhow::bail!("refresh endpoint unavailable")
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let refresher = Arc::new(CountingRefresher {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(50),
        });
        let guard = Arc::new(RefreshGuard::new());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let guard = guard.clone();
            let refresher = refresher.clone() as Arc<dyn CredentialRefresher>;
            handles.push(tokio::spawn(async move { guard.refresh(refresher).await }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "fresh-credential");
        }
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resolved_refresh_allows_a_new_one() {
        let refresher = Arc::new(CountingRefresher {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        });
        let guard = RefreshGuard::new();

        for _ in 0..2 {
            let outcome = guard
                .refresh(refresher.clone() as Arc<dyn CredentialRefresher>)
                .await;
            assert!(outcome.is_ok());
        }
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failure_propagates_to_every_waiter() {
        let guard = Arc::new(RefreshGuard::new());
        let refresher = Arc::new(FailingRefresher) as Arc<dyn CredentialRefresher>;

        let a = guard.refresh(refresher.clone()).await;
        assert!(a.unwrap_err().contains("unavailable"));
    }
}

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::clock::Clock;
use crate::store::{with_deadline, IdentityStore, StoreError};

/// Periodically deletes refresh tokens that are revoked or past expiry.
pub struct SessionCleaner {
    store: Arc<dyn IdentityStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    store_timeout: Duration,
}

impl SessionCleaner {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            interval,
            store_timeout,
        }
    }

    /// One sweep over every owner.
    pub async fn run_once(&self) -> Result<u64, StoreError> {
        self.sweep(None).await
    }

    /// One sweep restricted to `owners`.
    pub async fn purge_for(&self, owners: &[Uuid]) -> Result<u64, StoreError> {
        self.sweep(Some(owners)).await
    }

    async fn sweep(&self, owners: Option<&[Uuid]>) -> Result<u64, StoreError> {
        let deleted = with_deadline(
            self.store_timeout,
            self.store
                .delete_terminal_refresh_tokens(self.clock.now(), owners),
        )
        .await?;
        metrics::counter!("refresh_tokens_cleaned_total").increment(deleted);
        Ok(deleted)
    }

    /// Run sweeps on a fixed interval until `shutdown` is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(interval_secs = self.interval.as_secs(), "Session cleaner started");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Session cleaner shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        match self.run_once().await {
                            Ok(0) => {}
                            Ok(deleted) => tracing::info!(deleted, "Deleted terminal refresh tokens"),
                            Err(e) => tracing::error!(error = %e, "Refresh token cleanup failed"),
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Identity, NewRefreshToken, RefreshToken, Role};
    use crate::services::clock::ManualClock;
    use crate::store::MemoryIdentityStore;
    use chrono::Utc;

    async fn store_with_tokens(clock: &ManualClock) -> (Arc<MemoryIdentityStore>, Identity) {
        let store = Arc::new(MemoryIdentityStore::new());
        let owner = Identity::new("sub".into(), "name".into(), Role::User, clock.now());
        store.insert_identity(&owner).await.unwrap();
        for (raw, ttl) in [("short", chrono::Duration::seconds(30)), ("long", chrono::Duration::days(1))] {
            let id = Uuid::new_v4();
            store
                .insert_refresh_token(NewRefreshToken {
                    id,
                    owner_id: owner.id,
                    lineage_id: id,
                    token_hash: RefreshToken::hash_token(raw),
                    expires_at: clock.now() + ttl,
                    created_at: clock.now(),
                    issued_at: clock.now(),
                    ip_address: None,
                    user_agent: None,
                })
                .await
                .unwrap();
        }
        (store, owner)
    }

    #[tokio::test]
    async fn test_sweep_deletes_only_terminal_rows() {
        let clock = ManualClock::new(Utc::now());
        let (store, owner) = store_with_tokens(&clock).await;
        let cleaner = SessionCleaner::new(
            store.clone(),
            Arc::new(clock.clone()),
            Duration::from_secs(3600),
            Duration::from_secs(1),
        );

        assert_eq!(cleaner.run_once().await.unwrap(), 0);
        clock.advance(chrono::Duration::seconds(31));
        assert_eq!(cleaner.purge_for(&[Uuid::new_v4()]).await.unwrap(), 0);
        assert_eq!(cleaner.purge_for(&[owner.id]).await.unwrap(), 1);
        assert_eq!(store.refresh_tokens().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_cleaner_stops_on_cancel() {
        let clock = ManualClock::new(Utc::now());
        let (store, _) = store_with_tokens(&clock).await;
        clock.advance(chrono::Duration::seconds(31));

        let cleaner = SessionCleaner::new(
            store.clone(),
            Arc::new(clock.clone()),
            Duration::from_secs(3600),
            Duration::from_secs(1),
        );
        let shutdown = CancellationToken::new();
        let handle = cleaner.spawn(shutdown.clone());

        // The first tick fires immediately.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.refresh_tokens().len(), 1);

        shutdown.cancel();
        handle.await.unwrap();
    }
}

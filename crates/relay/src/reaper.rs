// Background reaper for abandoned sessions.
//
// Each cycle scans the store for sessions idle past the threshold and
// destroys them through the registry so in-memory group state and any
// still-connected members are torn down consistently. The staleness check
// re-runs under the session lock at destroy time, so a session refreshed
// after the scan snapshot survives that cycle.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::registry::{RegistryError, SessionRegistry};

const DEFAULT_INTERVAL_SECS: u64 = 300;
const DEFAULT_INACTIVITY_THRESHOLD_SECS: u64 = 1800;

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// How often to sweep the store.
    pub interval: Duration,
    /// Sessions idle longer than this are removed.
    pub inactivity_threshold: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
            inactivity_threshold: Duration::from_secs(DEFAULT_INACTIVITY_THRESHOLD_SECS),
        }
    }
}

/// Long-running reaper loop. Runs one sweep immediately, then once per
/// interval. A failed cycle is logged and retried on the next interval;
/// the loop only exits when the shutdown signal fires.
pub async fn run(
    registry: Arc<SessionRegistry>,
    config: ReaperConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        interval_secs = config.interval.as_secs(),
        threshold_secs = config.inactivity_threshold.as_secs(),
        "session reaper starting"
    );

    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                debug!("session cleanup check running");
                match sweep(&registry, config.inactivity_threshold).await {
                    Ok(0) => {}
                    Ok(reaped) => info!(reaped, "removed inactive sessions"),
                    Err(error) => warn!(error = %error, "session cleanup cycle failed"),
                }
            }
            _ = shutdown.changed() => {
                info!("session reaper shutting down");
                break;
            }
        }
    }
}

/// One reaper cycle: scan for stale candidates, then destroy each one
/// that is still stale at destroy time. Returns the number reaped.
pub async fn sweep(
    registry: &SessionRegistry,
    inactivity_threshold: Duration,
) -> Result<usize, RegistryError> {
    let cutoff = cutoff_before(Utc::now(), inactivity_threshold);
    let candidates = registry.store().stale_sessions(cutoff).await?;

    let mut reaped = 0;
    for session in candidates {
        match registry.reap_if_stale(&session.id, cutoff).await {
            Ok(true) => {
                metrics::increment_sessions_reaped();
                reaped += 1;
            }
            Ok(false) => {}
            Err(error) => {
                // One session's failure must not abort the rest of the sweep.
                warn!(session_id = %session.id, error = %error, "failed to reap session");
            }
        }
    }

    Ok(reaped)
}

fn cutoff_before(now: DateTime<Utc>, threshold: Duration) -> DateTime<Utc> {
    let threshold = chrono::Duration::from_std(threshold)
        .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_INACTIVITY_THRESHOLD_SECS as i64));
    now - threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::RandomIdentityProvider;
    use crate::store::SessionStore;
    use chrono::Duration as ChronoDuration;
    use cinder_common::types::SessionRecord;
    use uuid::Uuid;

    fn registry() -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(SessionStore::memory(), Arc::new(RandomIdentityProvider)))
    }

    async fn insert_session_idle_for(
        registry: &SessionRegistry,
        id: &str,
        idle: ChronoDuration,
    ) {
        let record = SessionRecord::new(id.to_string(), Utc::now() - idle);
        registry.store().insert_session(&record).await.unwrap();
    }

    #[tokio::test]
    async fn sweep_removes_sessions_past_the_threshold() {
        let registry = registry();
        insert_session_idle_for(&registry, "idle-31", ChronoDuration::minutes(31)).await;
        insert_session_idle_for(&registry, "idle-29", ChronoDuration::minutes(29)).await;

        let reaped = sweep(&registry, Duration::from_secs(1800)).await.unwrap();

        assert_eq!(reaped, 1);
        assert!(registry.store().session("idle-31").await.unwrap().is_none());
        assert!(registry.store().session("idle-29").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sweep_reaps_empty_session_created_long_ago() {
        // A session created with no joins still ages out.
        let registry = registry();
        insert_session_idle_for(&registry, "never-joined", ChronoDuration::hours(2)).await;

        let reaped = sweep(&registry, Duration::from_secs(1800)).await.unwrap();
        assert_eq!(reaped, 1);
    }

    #[tokio::test]
    async fn sweep_tears_down_live_groups_and_notifies_members() {
        let registry = registry();
        let session = registry.create_session().await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        registry.join(&session.id, Uuid::new_v4(), tx).await.unwrap();

        // Zero threshold: anything older than "now" is stale.
        let reaped = sweep(&registry, Duration::from_secs(0)).await.unwrap();

        assert_eq!(reaped, 1);
        assert!(registry.store().session(&session.id).await.unwrap().is_none());
        assert_eq!(
            rx.try_recv().ok(),
            Some(cinder_common::protocol::ws::WsMessage::SessionDestroyed)
        );
    }

    #[tokio::test]
    async fn session_touched_after_scan_survives_the_cycle() {
        let registry = registry();
        let session = registry.create_session().await.unwrap();

        // The candidate was refreshed between scan and destroy: the
        // re-check against the cutoff aborts this session's destruction.
        let stale_cutoff = Utc::now() - ChronoDuration::minutes(30);
        assert!(!registry.reap_if_stale(&session.id, stale_cutoff).await.unwrap());
        assert!(registry.store().session(&session.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn run_stops_promptly_on_shutdown() {
        let registry = registry();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run(
            registry,
            ReaperConfig { interval: Duration::from_secs(3600), ..Default::default() },
            shutdown_rx,
        ));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reaper should stop promptly")
            .expect("reaper task should not panic");
    }

    #[test]
    fn cutoff_is_threshold_before_now() {
        let now = Utc::now();
        let cutoff = cutoff_before(now, Duration::from_secs(1800));
        assert_eq!(now - cutoff, ChronoDuration::seconds(1800));
    }
}

//! Leader-Election / Sticky-Active Controller (C6, §4.6).
//!
//! `ElectionController` runs the STANDBY → CAMPAIGNING → ACTIVE state
//! machine for a single `(service_name, group_id)` the owning instance
//! participates in. It is best-effort mutual exclusion built on CAS + TTL,
//! not a consensus protocol: the invariant it upholds is "at most one
//! ACTIVE instance outside the clock-skew window around lease expiry", not
//! linearizable leadership.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, KvErrorKind, Result};
use crate::naming::leader_lease_key;
use crate::ports::{KvStore, PutOptions};
use crate::retry::campaign_jitter;
use crate::serialization::{self, WireFormat};
use crate::time::Clock;

/// §3.3 — the value written at `group-leader/<service_name>/<group_id>`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeaderLease {
    pub leader_instance_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub fencing_token: u64,
}

/// Current phase of the state machine in §4.6's diagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElectionState {
    Standby,
    Campaigning,
    Active,
}

/// Per-group election controller. One instance of this type exists per
/// `(service_name, group_id)` the service configures (§6.4
/// `sticky_active_group` is opt-in; a service typically runs zero or one).
pub struct ElectionController {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    service_name: String,
    group_id: String,
    instance_id: String,
    leader_ttl: Duration,
    lease_key: String,
    is_active: AtomicBool,
    fencing_token: AtomicU64,
    observed_revision: AtomicU64,
    refresh_failures: AtomicU64,
    state: parking_lot::Mutex<ElectionState>,
}

impl ElectionController {
    pub fn new(
        store: Arc<dyn KvStore>,
        service_name: impl Into<String>,
        group_id: impl Into<String>,
        instance_id: impl Into<String>,
        leader_ttl: Duration,
    ) -> Arc<Self> {
        Self::with_clock(store, service_name, group_id, instance_id, leader_ttl, crate::time::system_clock())
    }

    pub fn with_clock(
        store: Arc<dyn KvStore>,
        service_name: impl Into<String>,
        group_id: impl Into<String>,
        instance_id: impl Into<String>,
        leader_ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let service_name = service_name.into();
        let group_id = group_id.into();
        let lease_key = leader_lease_key(&service_name, &group_id);
        Arc::new(Self {
            store,
            clock,
            instance_id: instance_id.into(),
            lease_key,
            service_name,
            group_id,
            leader_ttl,
            is_active: AtomicBool::new(false),
            fencing_token: AtomicU64::new(0),
            observed_revision: AtomicU64::new(0),
            refresh_failures: AtomicU64::new(0),
            state: parking_lot::Mutex::new(ElectionState::Standby),
        })
    }

    /// Whether this instance currently believes it holds the lease. Read by
    /// [`crate::runtime::dispatch`]'s exclusive-RPC gate: `true` iff the
    /// most recent acquisition or refresh succeeded and no subsequent
    /// refresh has failed twice in a row.
    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::SeqCst)
    }

    /// The fencing token from the most recent successful acquisition.
    /// Advisory: callers should attach it to exclusive side effects so a
    /// downstream system can reject writes from a leader that has since
    /// been fenced out (§4.6 "Tie-breaking / liveness").
    pub fn fencing_token(&self) -> u64 {
        self.fencing_token.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ElectionState {
        *self.state.lock()
    }

    /// Runs one observe/campaign/attempt cycle (§4.6 "Acquisition
    /// algorithm"). Returns the delay the caller should wait before calling
    /// this again — shorter when standing by behind a live leader, shorter
    /// still when actively contending, and the full refresh interval when
    /// this call made us the leader (the caller is expected to switch to
    /// [`Self::run_refresh_loop`] once `is_active()` is true).
    #[instrument(skip(self), fields(service = %self.service_name, group = %self.group_id))]
    pub async fn tick(&self) -> Result<Duration> {
        let current = self.store.get(&self.lease_key).await.map_err(|e| self.unrecoverable(e))?;

        let contest = match &current {
            None => true,
            Some(entry) => {
                let lease: LeaderLease = serialization::decode(&entry.value)?;
                self.observed_revision.store(entry.revision, Ordering::SeqCst);
                if lease.leader_instance_id == self.instance_id {
                    // We think we're not active locally (otherwise we'd be
                    // in the refresh loop), but the lease still names us —
                    // a restart mid-term. Reclaim the active state rather
                    // than needlessly re-campaigning. `become_active` resets
                    // `observed_revision` to the stale acquisition-time
                    // fencing token, so re-stamp it with the lease's current
                    // KV revision afterward — otherwise the next `refresh()`
                    // CAS is built on a revision several refreshes stale and
                    // fails every time, triggering a spurious step-down.
                    self.become_active(lease.fencing_token);
                    self.observed_revision.store(entry.revision, Ordering::SeqCst);
                    return Ok(self.leader_ttl / 3);
                }
                lease.expires_at <= Utc::now()
            }
        };

        if !contest {
            *self.state.lock() = ElectionState::Standby;
            let half = self.leader_ttl / 2;
            let jitter = campaign_jitter(&self.instance_id, half / 4.max(1));
            return Ok(half + jitter);
        }

        *self.state.lock() = ElectionState::Campaigning;
        let jitter = campaign_jitter(&self.instance_id, self.leader_ttl / 4);
        self.clock.sleep(jitter).await;

        self.attempt(current.map(|e| e.revision)).await
    }

    async fn attempt(&self, observed_revision: Option<u64>) -> Result<Duration> {
        let now = Utc::now();
        let lease = LeaderLease {
            leader_instance_id: self.instance_id.clone(),
            acquired_at: now,
            expires_at: now + chrono::Duration::from_std(self.leader_ttl).unwrap_or(chrono::Duration::seconds(2)),
            fencing_token: 0,
        };
        let bytes = serialization::encode(&lease, WireFormat::Binary)?;

        let result = match observed_revision {
            None => self.store.create(&self.lease_key, bytes, PutOptions::default()).await,
            Some(revision) => self.store.update(&self.lease_key, bytes, revision, PutOptions::default()).await,
        };

        match result {
            Ok(acquisition_revision) => {
                // The token observers should treat as the fencing token is
                // the revision this acquisition produced. Stamp it into the
                // stored value with one more CAS so later readers don't see
                // the placeholder `0` written above; this is best-effort —
                // if it fails (lost the lease already) we still hold the
                // in-memory active state from `acquisition_revision` until
                // the next refresh notices.
                let stamped = LeaderLease {
                    fencing_token: acquisition_revision,
                    ..lease
                };
                let stamped_bytes = serialization::encode(&stamped, WireFormat::Binary)?;
                let observed_after_stamp = match self
                    .store
                    .update(&self.lease_key, stamped_bytes, acquisition_revision, PutOptions::default())
                    .await
                {
                    Ok(revision) => revision,
                    Err(err) => {
                        warn!(error = %err, "failed to stamp fencing token onto lease, retaining unstamped revision");
                        acquisition_revision
                    }
                };
                self.become_active(acquisition_revision);
                self.observed_revision.store(observed_after_stamp, Ordering::SeqCst);
                info!(fencing_token = acquisition_revision, "acquired leader lease");
                Ok(self.leader_ttl / 3)
            }
            Err(Error::KvError { kind: KvErrorKind::KeyExists, .. })
            | Err(Error::KvError { kind: KvErrorKind::RevisionMismatch { .. }, .. }) => {
                debug!("lost campaign to another contender");
                *self.state.lock() = ElectionState::Standby;
                let jitter = campaign_jitter(&self.instance_id, self.leader_ttl / 2);
                Ok(self.leader_ttl / 2 + jitter)
            }
            Err(other) => Err(self.unrecoverable(other)),
        }
    }

    fn become_active(&self, fencing_token: u64) {
        self.fencing_token.store(fencing_token, Ordering::SeqCst);
        self.observed_revision.store(fencing_token, Ordering::SeqCst);
        self.refresh_failures.store(0, Ordering::SeqCst);
        self.is_active.store(true, Ordering::SeqCst);
        *self.state.lock() = ElectionState::Active;
    }

    fn step_down(&self) {
        self.is_active.store(false, Ordering::SeqCst);
        *self.state.lock() = ElectionState::Standby;
    }

    fn unrecoverable(&self, source: Error) -> Error {
        Error::ElectionError {
            group_id: self.group_id.clone(),
            message: source.to_string(),
        }
    }

    /// Refreshes the lease every `leader_ttl / 3` while active (§4.6
    /// "Refresh (heartbeat) while ACTIVE"). Two consecutive CAS failures
    /// step down immediately; a single failure is logged and retried on the
    /// next tick, since transient contention or backend hiccups are
    /// expected and not by themselves evidence of having lost leadership.
    #[instrument(skip(self), fields(service = %self.service_name, group = %self.group_id))]
    pub async fn refresh(&self) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }
        let now = Utc::now();
        let lease = LeaderLease {
            leader_instance_id: self.instance_id.clone(),
            acquired_at: now,
            expires_at: now + chrono::Duration::from_std(self.leader_ttl).unwrap_or(chrono::Duration::seconds(2)),
            fencing_token: self.fencing_token(),
        };
        let bytes = serialization::encode(&lease, WireFormat::Binary)?;
        let revision = self.observed_revision.load(Ordering::SeqCst);

        match self.store.update(&self.lease_key, bytes, revision, PutOptions::default()).await {
            Ok(new_revision) => {
                self.observed_revision.store(new_revision, Ordering::SeqCst);
                self.refresh_failures.store(0, Ordering::SeqCst);
                Ok(())
            }
            Err(err) => {
                let failures = self.refresh_failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(error = %err, failures, "lease refresh failed");
                if failures >= 2 {
                    self.step_down();
                }
                Ok(())
            }
        }
    }

    /// Releases the lease on graceful shutdown (§4.6 "On graceful shutdown,
    /// attempt delete of the lease; log and ignore failure"). Never
    /// returns an error: TTL will reclaim the lease if the delete itself
    /// fails.
    #[instrument(skip(self), fields(service = %self.service_name, group = %self.group_id))]
    pub async fn release(&self) {
        if !self.is_active() {
            return;
        }
        if let Err(err) = self.store.delete(&self.lease_key).await {
            warn!(error = %err, "failed to release leader lease, relying on TTL");
        }
        self.step_down();
    }

    /// Drives [`Self::tick`] in a loop until `is_active()` becomes true,
    /// then switches to refreshing the lease every `leader_ttl / 3` until
    /// cancelled. Intended to be spawned as its own task by
    /// [`crate::runtime::service::Service`].
    pub async fn run(self: Arc<Self>) {
        loop {
            if self.is_active() {
                if let Err(err) = self.refresh().await {
                    warn!(error = %err, "unrecoverable error refreshing leader lease");
                }
                self.clock.sleep(self.leader_ttl / 3).await;
                continue;
            }
            match self.tick().await {
                Ok(delay) => self.clock.sleep(delay).await,
                Err(err) => {
                    warn!(error = %err, "unrecoverable error during election tick");
                    self.clock.sleep(self.leader_ttl).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::InMemoryKvStore;

    fn controller(store: Arc<InMemoryKvStore>, instance_id: &str, clock: Arc<dyn Clock>) -> Arc<ElectionController> {
        ElectionController::with_clock(store, "order", "primary", instance_id, Duration::from_secs(2), clock)
    }

    #[tokio::test]
    async fn first_campaigner_becomes_active() {
        let store = Arc::new(InMemoryKvStore::new());
        let clock = crate::time::system_clock();
        let controller = controller(store, "order-1", clock);
        controller.tick().await.unwrap();
        assert!(controller.is_active());
        assert_eq!(controller.state(), ElectionState::Active);
        assert!(controller.fencing_token() > 0);
    }

    #[tokio::test]
    async fn second_campaigner_stands_down_once_lease_exists() {
        let store = Arc::new(InMemoryKvStore::new());
        let clock = crate::time::system_clock();
        let leader = controller(store.clone(), "order-1", clock.clone());
        leader.tick().await.unwrap();
        assert!(leader.is_active());

        let follower = controller(store, "order-2", clock);
        follower.tick().await.unwrap();
        assert!(!follower.is_active());
        assert_eq!(follower.state(), ElectionState::Standby);
    }

    #[tokio::test]
    async fn release_clears_active_state_and_lease() {
        let store = Arc::new(InMemoryKvStore::new());
        let clock = crate::time::system_clock();
        let leader = controller(store.clone(), "order-1", clock.clone());
        leader.tick().await.unwrap();
        assert!(leader.is_active());

        leader.release().await;
        assert!(!leader.is_active());

        let follower = controller(store, "order-2", clock);
        follower.tick().await.unwrap();
        assert!(follower.is_active());
    }

    #[tokio::test]
    async fn two_failed_refreshes_step_down() {
        let store = Arc::new(InMemoryKvStore::new());
        let clock = crate::time::system_clock();
        let leader = controller(store.clone(), "order-1", clock);
        leader.tick().await.unwrap();
        assert!(leader.is_active());

        // Simulate another process stealing the lease out from under us by
        // forcing a revision mismatch: bump the observed revision past what
        // the store actually holds.
        leader.observed_revision.store(9_999, Ordering::SeqCst);
        leader.refresh().await.unwrap();
        assert!(leader.is_active(), "one failure should not step down");
        leader.refresh().await.unwrap();
        assert!(!leader.is_active(), "two consecutive failures should step down");
    }

    #[tokio::test]
    async fn restart_mid_term_reclaim_does_not_poison_observed_revision() {
        let store = Arc::new(InMemoryKvStore::new());
        let clock = crate::time::system_clock();

        let original = controller(store.clone(), "order-1", clock.clone());
        original.tick().await.unwrap();
        assert!(original.is_active());

        // Bump the real KV revision well past the original acquisition's
        // fencing token, the way several successful refresh cycles would.
        for _ in 0..3 {
            original.refresh().await.unwrap();
        }
        assert!(original.is_active(), "refreshes should keep the original controller active");

        // Simulate the process restarting: a fresh controller for the same
        // instance_id, with no memory of the prior `observed_revision`.
        let restarted = controller(store, "order-1", clock);
        restarted.tick().await.unwrap();
        assert!(restarted.is_active(), "tick should reclaim the still-valid lease naming this instance");

        // The reclaim must have re-stamped `observed_revision` to the
        // lease's current KV revision, not left it pinned at the stale
        // acquisition-time fencing token — otherwise every subsequent
        // refresh CAS fails and two of them trigger a spurious step-down.
        restarted.refresh().await.unwrap();
        assert!(restarted.is_active(), "one refresh after reclaim should not fail");
        restarted.refresh().await.unwrap();
        assert!(restarted.is_active(), "a second refresh after reclaim should still not fail");
    }
}

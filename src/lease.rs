//! Lease-based lock manager.
//!
//! Serializes conflicting writes. Locks are keyed per uid (allowing
//! parallelism across distinct invoices) with a whole-sheet key
//! ([`SHEET_LEASE_KEY`]) used only for index rebuilds. The sheet lease
//! conflicts with every uid lease and vice versa.
//!
//! # Leases, not locks
//!
//! The remote side provides no crash-detection signal, so every lock is a
//! lease: it carries an expiry, and a lease that is not renewed before
//! expiry is considered abandoned and may be forcibly acquired by another
//! caller. This bounds the damage of a crashed holder to one lease
//! interval. Fencing sequence numbers make a lapsed token detectable:
//! `renew`/`release` with a stale token fail with `LeaseExpired`.
//!
//! # Bounded acquisition
//!
//! `acquire` never blocks indefinitely: callers supply a timeout after
//! which `Contended` is returned. Waiters are woken on release and also
//! wake themselves at the earliest conflicting expiry, so an abandoned
//! lease never strands them.

use crate::error::{Result, SyncError};
use crate::metrics;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Key of the whole-sheet lease, used for index rebuilds.
pub const SHEET_LEASE_KEY: &str = "__sheet__";

/// Proof of a held lease. Not cloneable; surrender it via
/// [`LeaseManager::release`].
#[derive(Debug)]
pub struct LeaseToken {
    key: String,
    owner: String,
    seq: u64,
    expires_at: Instant,
}

impl LeaseToken {
    /// The lease key (uid or [`SHEET_LEASE_KEY`]).
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Owner identity the lease was granted to.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Check whether the lease interval has lapsed.
    ///
    /// Local view only; another caller may already have taken the key
    /// over. Use [`LeaseManager::validate`] for the authoritative answer.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

struct HeldLease {
    owner: String,
    seq: u64,
    expires_at: Instant,
}

/// In-process lease table.
///
/// The table is shared by every writer task in this process; mutual
/// exclusion across processes would slot in behind the same interface.
/// The inner mutex is a plain `std::sync::Mutex`: critical sections are
/// short and never held across an await point.
pub struct LeaseManager {
    owner: String,
    table: Mutex<HashMap<String, HeldLease>>,
    released: Notify,
    next_seq: AtomicU64,
}

impl LeaseManager {
    /// Create a lease manager with the given owner identity.
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            table: Mutex::new(HashMap::new()),
            released: Notify::new(),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Try to acquire a lease without waiting.
    ///
    /// Expired leases encountered along the way are reclaimed.
    pub fn try_acquire(&self, key: &str, lease_duration: Duration) -> Option<LeaseToken> {
        let mut table = self.table.lock().expect("lease table poisoned");
        let now = Instant::now();

        table.retain(|k, held| {
            if held.expires_at <= now {
                warn!(key = %k, owner = %held.owner, "Lease expired without release; reclaiming");
                metrics::record_lease_expired(k);
                false
            } else {
                true
            }
        });

        let conflict = if key == SHEET_LEASE_KEY {
            !table.is_empty()
        } else {
            table.contains_key(SHEET_LEASE_KEY) || table.contains_key(key)
        };
        if conflict {
            return None;
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let expires_at = now + lease_duration;
        table.insert(
            key.to_string(),
            HeldLease {
                owner: self.owner.clone(),
                seq,
                expires_at,
            },
        );
        debug!(key, seq, "Lease acquired");
        Some(LeaseToken {
            key: key.to_string(),
            owner: self.owner.clone(),
            seq,
            expires_at,
        })
    }

    /// Acquire a lease, waiting at most `timeout`.
    ///
    /// Returns `Contended` if the key (or a conflicting key) stays held
    /// past the deadline. Never waits past the earliest conflicting
    /// expiry, so an abandoned lease is taken over promptly.
    pub async fn acquire(
        &self,
        key: &str,
        lease_duration: Duration,
        timeout: Duration,
    ) -> Result<LeaseToken> {
        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            let notified = self.released.notified();
            if let Some(token) = self.try_acquire(key, lease_duration) {
                metrics::record_lease_wait(started.elapsed());
                return Ok(token);
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(key, "Lease acquisition timed out");
                metrics::record_lease_contended(key);
                return Err(SyncError::Contended {
                    key: key.to_string(),
                });
            }
            let wake_at = self
                .earliest_conflicting_expiry(key)
                .map_or(deadline, |expiry| expiry.min(deadline));
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake_at)) => {}
            }
        }
    }

    /// Extend a held lease by `lease_duration` from now.
    ///
    /// Fails with `LeaseExpired` if the lease lapsed or was taken over.
    pub fn renew(&self, token: &mut LeaseToken, lease_duration: Duration) -> Result<()> {
        let mut table = self.table.lock().expect("lease table poisoned");
        let now = Instant::now();

        let renewed = match table.get_mut(&token.key) {
            Some(held) if held.seq == token.seq && held.expires_at > now => {
                held.expires_at = now + lease_duration;
                token.expires_at = held.expires_at;
                true
            }
            _ => false,
        };

        if renewed {
            debug!(key = %token.key, "Lease renewed");
            return Ok(());
        }

        // Drop our own lapsed entry so waiters stop seeing it.
        if matches!(table.get(&token.key), Some(held) if held.seq == token.seq) {
            table.remove(&token.key);
            drop(table);
            self.released.notify_waiters();
        }
        Err(SyncError::LeaseExpired {
            key: token.key.clone(),
        })
    }

    /// Release a lease and wake waiters.
    ///
    /// Releasing a token whose lease was already taken over fails with
    /// `LeaseExpired` and leaves the new holder untouched.
    pub fn release(&self, token: LeaseToken) -> Result<()> {
        let mut table = self.table.lock().expect("lease table poisoned");
        let ours = matches!(table.get(&token.key), Some(held) if held.seq == token.seq);
        if !ours {
            return Err(SyncError::LeaseExpired { key: token.key });
        }
        table.remove(&token.key);
        drop(table);
        self.released.notify_waiters();
        debug!(key = %token.key, "Lease released");
        Ok(())
    }

    /// Check that a token still names the current, unexpired holder.
    pub fn validate(&self, token: &LeaseToken) -> bool {
        let table = self.table.lock().expect("lease table poisoned");
        matches!(
            table.get(&token.key),
            Some(held) if held.seq == token.seq && held.expires_at > Instant::now()
        )
    }

    /// Check if a key is currently held (and unexpired).
    pub fn is_held(&self, key: &str) -> bool {
        let table = self.table.lock().expect("lease table poisoned");
        matches!(table.get(key), Some(held) if held.expires_at > Instant::now())
    }

    /// Number of live leases, for health checks.
    pub fn held_count(&self) -> usize {
        let now = Instant::now();
        let table = self.table.lock().expect("lease table poisoned");
        table.values().filter(|h| h.expires_at > now).count()
    }

    fn earliest_conflicting_expiry(&self, key: &str) -> Option<Instant> {
        let table = self.table.lock().expect("lease table poisoned");
        if key == SHEET_LEASE_KEY {
            table.values().map(|h| h.expires_at).min()
        } else {
            let own = table.get(key).map(|h| h.expires_at);
            let sheet = table.get(SHEET_LEASE_KEY).map(|h| h.expires_at);
            match (own, sheet) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const LEASE: Duration = Duration::from_millis(200);
    const SHORT: Duration = Duration::from_millis(30);

    #[tokio::test]
    async fn test_acquire_and_release() {
        let leases = LeaseManager::new("writer-1");
        let token = leases.acquire("INV-001", LEASE, SHORT).await.unwrap();
        assert!(leases.is_held("INV-001"));
        assert!(leases.validate(&token));
        leases.release(token).unwrap();
        assert!(!leases.is_held("INV-001"));
    }

    #[tokio::test]
    async fn test_contended_within_timeout() {
        let leases = LeaseManager::new("writer-1");
        let _held = leases.acquire("INV-001", LEASE, SHORT).await.unwrap();

        let result = leases.acquire("INV-001", LEASE, SHORT).await;
        assert!(matches!(result, Err(SyncError::Contended { .. })));
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_conflict() {
        let leases = LeaseManager::new("writer-1");
        let a = leases.acquire("INV-001", LEASE, SHORT).await.unwrap();
        let b = leases.acquire("INV-002", LEASE, SHORT).await.unwrap();
        assert_eq!(leases.held_count(), 2);
        leases.release(a).unwrap();
        leases.release(b).unwrap();
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimable_and_not_before() {
        let leases = LeaseManager::new("writer-1");
        let _abandoned = leases.acquire("INV-001", Duration::from_millis(60), SHORT).await.unwrap();

        // Before expiry: still held
        assert!(leases.try_acquire("INV-001", LEASE).is_none());

        tokio::time::sleep(Duration::from_millis(80)).await;

        // After expiry: forcibly acquirable
        let token = leases.try_acquire("INV-001", LEASE);
        assert!(token.is_some());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let leases = Arc::new(LeaseManager::new("writer-1"));
        let held = leases.acquire("INV-001", LEASE, SHORT).await.unwrap();

        let leases2 = Arc::clone(&leases);
        let waiter = tokio::spawn(async move {
            let start = Instant::now();
            let token = leases2
                .acquire("INV-001", LEASE, Duration::from_millis(500))
                .await
                .unwrap();
            (start.elapsed(), token)
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        leases.release(held).unwrap();

        let (waited, token) = waiter.await.unwrap();
        assert!(waited >= Duration::from_millis(40), "should have waited");
        leases.release(token).unwrap();
    }

    #[tokio::test]
    async fn test_acquire_waits_out_abandoned_lease() {
        let leases = LeaseManager::new("writer-1");
        let _abandoned = leases.acquire("INV-001", Duration::from_millis(50), SHORT).await.unwrap();

        // Waiter outlives the abandoned lease and takes over without a release.
        let token = leases
            .acquire("INV-001", LEASE, Duration::from_millis(500))
            .await
            .unwrap();
        assert!(leases.validate(&token));
    }

    #[tokio::test]
    async fn test_renew_extends_lease() {
        let leases = LeaseManager::new("writer-1");
        let mut token = leases.acquire("INV-001", Duration::from_millis(80), SHORT).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        leases.renew(&mut token, Duration::from_millis(80)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Without the renewal this would have lapsed by now.
        assert!(leases.validate(&token));
    }

    #[tokio::test]
    async fn test_stale_token_renew_fails() {
        let leases = LeaseManager::new("writer-1");
        let mut stale = leases.acquire("INV-001", Duration::from_millis(40), SHORT).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let _taken_over = leases.try_acquire("INV-001", LEASE).unwrap();

        let result = leases.renew(&mut stale, LEASE);
        assert!(matches!(result, Err(SyncError::LeaseExpired { .. })));
    }

    #[tokio::test]
    async fn test_stale_token_release_leaves_new_holder() {
        let leases = LeaseManager::new("writer-1");
        let stale = leases.acquire("INV-001", Duration::from_millis(40), SHORT).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let taken_over = leases.try_acquire("INV-001", LEASE).unwrap();

        assert!(leases.release(stale).is_err());
        assert!(leases.validate(&taken_over));
    }

    #[tokio::test]
    async fn test_sheet_lease_excludes_uid_leases() {
        let leases = LeaseManager::new("writer-1");
        let sheet = leases.acquire(SHEET_LEASE_KEY, LEASE, SHORT).await.unwrap();

        assert!(leases.try_acquire("INV-001", LEASE).is_none());
        leases.release(sheet).unwrap();
        assert!(leases.try_acquire("INV-001", LEASE).is_some());
    }

    #[tokio::test]
    async fn test_uid_lease_excludes_sheet_lease() {
        let leases = LeaseManager::new("writer-1");
        let uid = leases.acquire("INV-001", LEASE, SHORT).await.unwrap();

        assert!(leases.try_acquire(SHEET_LEASE_KEY, LEASE).is_none());
        leases.release(uid).unwrap();
        assert!(leases.try_acquire(SHEET_LEASE_KEY, LEASE).is_some());
    }
}

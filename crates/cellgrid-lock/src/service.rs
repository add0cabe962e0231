//! Lease operations over the state store.

use std::time::Duration;

use cellgrid_state::{Expected, LeaseRecord, StateStore, Term, epoch_millis};
use tracing::{debug, info};

use crate::error::LockResult;

/// Acquires, renews and releases named leases for one owner.
#[derive(Clone)]
pub struct LockService {
    store: StateStore,
    owner: String,
    ttl: Duration,
}

impl LockService {
    pub fn new(store: StateStore, owner: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            owner: owner.into(),
            ttl,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn expiry(&self, now: u64) -> u64 {
        now + self.ttl.as_millis() as u64
    }

    /// Take the lease if it is free, expired, or already ours.
    ///
    /// Returns `None` when another owner holds a live lease or a
    /// concurrent acquirer won the race. Taking over an expired lease
    /// (including our own) starts a new term.
    pub fn try_acquire(&self, name: &str) -> LockResult<Option<LeaseRecord>> {
        let now = epoch_millis();
        let (record, expected) = match self.store.get_lease(name)? {
            None => (
                LeaseRecord {
                    name: name.to_string(),
                    owner: self.owner.clone(),
                    term: 1,
                    expires_at: self.expiry(now),
                },
                Expected::Absent,
            ),
            Some(current) if current.value.is_live(now) => {
                if current.value.owner != self.owner {
                    debug!(lock = name, holder = %current.value.owner, "lease held elsewhere");
                    return Ok(None);
                }
                (
                    LeaseRecord {
                        expires_at: self.expiry(now),
                        ..current.value
                    },
                    Expected::Version(current.version),
                )
            }
            Some(current) => (
                LeaseRecord {
                    name: name.to_string(),
                    owner: self.owner.clone(),
                    term: current.value.term + 1,
                    expires_at: self.expiry(now),
                },
                Expected::Version(current.version),
            ),
        };

        match self.store.write_lease(&record, expected) {
            Ok(_) => {
                info!(lock = name, owner = %self.owner, term = record.term, "lease acquired");
                Ok(Some(record))
            }
            Err(e) if e.is_conflict() => {
                debug!(lock = name, error = %e, "lost lease acquisition race");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Extend a lease we hold at `term`. Returns `None` if it was lost.
    pub fn renew(&self, name: &str, term: Term) -> LockResult<Option<LeaseRecord>> {
        let now = epoch_millis();
        let Some(current) = self.store.get_lease(name)? else {
            return Ok(None);
        };
        if current.value.owner != self.owner
            || current.value.term != term
            || !current.value.is_live(now)
        {
            return Ok(None);
        }
        let record = LeaseRecord {
            expires_at: self.expiry(now),
            ..current.value
        };
        match self
            .store
            .write_lease(&record, Expected::Version(current.version))
        {
            Ok(_) => Ok(Some(record)),
            Err(e) if e.is_conflict() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Give up a lease we hold at `term`.
    ///
    /// The record stays in place with an expiry in the past so the next
    /// owner continues the term sequence.
    pub fn release(&self, name: &str, term: Term) -> LockResult<bool> {
        let Some(current) = self.store.get_lease(name)? else {
            return Ok(false);
        };
        if current.value.owner != self.owner || current.value.term != term {
            return Ok(false);
        }
        let record = LeaseRecord {
            expires_at: 0,
            ..current.value
        };
        match self
            .store
            .write_lease(&record, Expected::Version(current.version))
        {
            Ok(_) => {
                info!(lock = name, owner = %self.owner, term, "lease released");
                Ok(true)
            }
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// The live lease for `name`, if anyone holds one.
    pub fn holder(&self, name: &str) -> LockResult<Option<LeaseRecord>> {
        let now = epoch_millis();
        Ok(self
            .store
            .get_lease(name)?
            .map(|v| v.value)
            .filter(|lease| lease.is_live(now)))
    }
}

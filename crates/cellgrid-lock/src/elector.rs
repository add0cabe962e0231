//! Background leader election over a single named lease.

use std::time::{Duration, Instant};

use cellgrid_state::{StateStore, Term};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{LockError, LockResult};
use crate::service::LockService;

/// Timing for a [`LeaderElector`].
#[derive(Debug, Clone)]
pub struct ElectorConfig {
    /// Lease lifetime written to the store.
    pub ttl: Duration,
    /// How often a leader renews.
    pub renew_interval: Duration,
    /// How often a follower retries acquisition.
    pub retry_interval: Duration,
}

impl ElectorConfig {
    /// Renew and retry at a third of the lease lifetime.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            renew_interval: ttl / 3,
            retry_interval: ttl / 3,
        }
    }

    fn validate(&self) -> LockResult<()> {
        if self.renew_interval.is_zero() || self.renew_interval >= self.ttl {
            return Err(LockError::Config(format!(
                "renew interval {:?} must be non-zero and shorter than ttl {:?}",
                self.renew_interval, self.ttl
            )));
        }
        Ok(())
    }
}

impl Default for ElectorConfig {
    fn default() -> Self {
        Self::with_ttl(Duration::from_secs(10))
    }
}

/// Leadership as seen locally.
#[derive(Debug, Clone)]
pub struct LeaseGrant {
    pub term: Term,
    /// Local deadline after which the holder must stop acting, even if no
    /// renewal failure has been observed yet.
    pub valid_until: Instant,
}

/// Read-only view of an elector's current grant.
#[derive(Clone)]
pub struct LeaderHandle {
    rx: watch::Receiver<Option<LeaseGrant>>,
}

impl LeaderHandle {
    /// The term to stamp writes with, or `None` when not leading.
    pub fn current_term(&self) -> Option<Term> {
        self.rx
            .borrow()
            .as_ref()
            .filter(|grant| grant.valid_until > Instant::now())
            .map(|grant| grant.term)
    }

    pub fn is_leader(&self) -> bool {
        self.current_term().is_some()
    }

    /// Wait until this handle reports leadership.
    pub async fn wait_for_leadership(&mut self) -> Term {
        loop {
            if let Some(term) = self.current_term() {
                return term;
            }
            if self.rx.changed().await.is_err() {
                // Elector gone; leadership can never arrive.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Keeps one named lease and publishes whether we hold it.
pub struct LeaderElector {
    service: LockService,
    name: String,
    config: ElectorConfig,
    tx: watch::Sender<Option<LeaseGrant>>,
}

impl LeaderElector {
    pub fn new(
        store: StateStore,
        name: impl Into<String>,
        owner: impl Into<String>,
        config: ElectorConfig,
    ) -> LockResult<Self> {
        config.validate()?;
        let (tx, _) = watch::channel(None);
        Ok(Self {
            service: LockService::new(store, owner, config.ttl),
            name: name.into(),
            config,
            tx,
        })
    }

    pub fn handle(&self) -> LeaderHandle {
        LeaderHandle {
            rx: self.tx.subscribe(),
        }
    }

    fn grant(&self) -> Option<LeaseGrant> {
        self.tx.borrow().clone()
    }

    /// One acquire-or-renew attempt.
    pub fn tick(&self) -> LockResult<()> {
        let started = Instant::now();
        let held = self.grant();
        let outcome = match &held {
            Some(grant) => self.service.renew(&self.name, grant.term),
            None => self.service.try_acquire(&self.name),
        };
        match outcome {
            Ok(Some(lease)) => {
                let valid_until = started + (self.config.ttl - self.config.renew_interval);
                if held.is_none() {
                    info!(lock = %self.name, term = lease.term, "became leader");
                }
                self.tx.send_replace(Some(LeaseGrant {
                    term: lease.term,
                    valid_until,
                }));
                Ok(())
            }
            Ok(None) => {
                if let Some(grant) = held {
                    warn!(lock = %self.name, term = grant.term, "lost leadership");
                }
                self.tx.send_replace(None);
                Ok(())
            }
            // Keep the grant; it lapses on its own deadline.
            Err(e) => Err(e),
        }
    }

    /// Run until shutdown, then release the lease if held.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(lock = %self.name, owner = %self.service.owner(), "leader elector started");
        loop {
            if let Err(e) = self.tick() {
                warn!(lock = %self.name, error = %e, "lease tick failed");
            }
            let wait = if self.grant().is_some() {
                self.config.renew_interval
            } else {
                self.config.retry_interval
            };
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {
                    info!(lock = %self.name, "leader elector shutting down");
                    break;
                }
            }
        }
        if let Some(grant) = self.tx.send_replace(None)
            && let Err(e) = self.service.release(&self.name, grant.term)
        {
            warn!(lock = %self.name, error = %e, "lease release failed");
        }
    }
}

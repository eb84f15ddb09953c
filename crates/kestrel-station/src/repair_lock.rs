//! Timed single-holder repair lock.
//!
//! A successful request (re)starts a tick timer. Every tick bumps a counter;
//! once it reaches `expiry_ticks` without a renewing request the lock is
//! released, so a repair client that vanished cannot hold it forever.

use crate::audit::AuditLogger;
use crate::config::RepairLockConfig;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    /// Held by the same requester; the expiry counter was reset
    Renewed,
    AlreadyLocked { holder: IpAddr },
}

impl LockOutcome {
    pub fn is_granted(&self) -> bool {
        !matches!(self, LockOutcome::AlreadyLocked { .. })
    }

    /// Reply text sent to the requester.
    pub fn reply(&self) -> &'static str {
        if self.is_granted() {
            "LOCKED"
        } else {
            "ALREADY LOCKED"
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockOutcome {
    Released,
    NotHolder,
}

impl UnlockOutcome {
    pub fn reply(&self) -> &'static str {
        match self {
            UnlockOutcome::Released => "UNLOCKED",
            UnlockOutcome::NotHolder => "NOT HOLDER",
        }
    }
}

#[derive(Debug, Default)]
struct LockState {
    holder: Option<IpAddr>,
    ticks: u32,
    /// Bumped on every grant so a superseded timer stops touching the state
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl LockState {
    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Debug, Clone)]
pub struct RepairLock {
    state: Arc<Mutex<LockState>>,
    config: RepairLockConfig,
    audit_enabled: bool,
}

impl RepairLock {
    pub fn new(config: RepairLockConfig, audit_enabled: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(LockState::default())),
            config,
            audit_enabled,
        }
    }

    pub fn config(&self) -> &RepairLockConfig {
        &self.config
    }

    pub async fn holder(&self) -> Option<IpAddr> {
        self.state.lock().await.holder
    }

    /// Acquire or renew the lock for `requester`.
    pub async fn request(&self, requester: IpAddr) -> LockOutcome {
        let mut state = self.state.lock().await;
        let outcome = match state.holder {
            Some(holder) if holder != requester => {
                debug!("Repair lock request from {} denied, held by {}", requester, holder);
                if self.audit_enabled {
                    AuditLogger::repair_lock_denied(requester, holder);
                }
                return LockOutcome::AlreadyLocked { holder };
            }
            Some(_) => LockOutcome::Renewed,
            None => LockOutcome::Acquired,
        };

        state.stop_timer();
        state.holder = Some(requester);
        state.ticks = 0;
        state.generation += 1;
        state.timer = Some(self.spawn_timer(state.generation));

        info!("Repair lock {:?} by {}", outcome, requester);
        if self.audit_enabled {
            AuditLogger::repair_lock_acquired(requester, outcome == LockOutcome::Renewed);
        }
        outcome
    }

    /// Release the lock if `requester` holds it.
    pub async fn release(&self, requester: IpAddr) -> UnlockOutcome {
        let mut state = self.state.lock().await;
        if state.holder != Some(requester) {
            return UnlockOutcome::NotHolder;
        }
        state.stop_timer();
        state.holder = None;
        state.ticks = 0;
        info!("Repair lock released by {}", requester);
        if self.audit_enabled {
            AuditLogger::repair_lock_released(requester);
        }
        UnlockOutcome::Released
    }

    /// Advance the expiry counter by one tick. Returns the holder if this tick
    /// released the lock.
    pub async fn tick(&self) -> Option<IpAddr> {
        let mut state = self.state.lock().await;
        self.tick_locked(&mut state)
    }

    /// Drop the holder and stop the timer.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.stop_timer();
        state.holder = None;
    }

    fn tick_locked(&self, state: &mut LockState) -> Option<IpAddr> {
        let holder = state.holder?;
        state.ticks += 1;
        if state.ticks < self.config.expiry_ticks {
            return None;
        }

        state.holder = None;
        state.ticks = 0;
        info!(
            "Repair lock held by {} expired after {} ticks",
            holder, self.config.expiry_ticks
        );
        if self.audit_enabled {
            AuditLogger::repair_lock_expired(holder, self.config.expiry_ticks);
        }
        Some(holder)
    }

    fn spawn_timer(&self, generation: u64) -> JoinHandle<()> {
        let lock = self.clone();
        let period = self.config.tick_interval();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let mut state = lock.state.lock().await;
                if state.generation != generation {
                    break;
                }
                if lock.tick_locked(&mut state).is_some() || state.holder.is_none() {
                    state.timer = None;
                    break;
                }
            }
        })
    }
}

//! Session: the single unlocked vault of this process.
//!
//! Holds the DEK and the open store between `unlock` and `lock`. Every
//! vault operation goes through [`SessionManager::acquire`], which checks
//! the inactivity deadline and records activity. A background timer task
//! locks the session when the deadline passes even if nobody calls in.
//!
//! Handles returned by `acquire` keep the DEK alive (via `Arc`) until the
//! in-flight operation finishes; locking closes the store so any further
//! query on it fails fast.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use kw_crypto::SecretKey;
use kw_store::VaultStore;
use parking_lot::Mutex;
use rand::RngCore;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::VaultError;
use crate::limiter::RateLimiter;

const TOKEN_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Locked,
    Unlocking,
    Unlocked,
}

/// What `begin_unlock` decided.
#[derive(Debug)]
pub enum UnlockMode {
    /// No session; the caller must open the vault and pass the ticket to
    /// `complete_unlock` or `abort_unlock`.
    Fresh(PendingUnlock),
    /// The same vault is already unlocked; verify the password and call
    /// `reauthenticate`.
    Reauthenticate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockReason {
    Explicit,
    Inactivity,
    StorageFailure,
    Deleted,
}

/// Borrowed view of the unlocked vault for one operation.
#[derive(Clone)]
pub struct SessionHandle {
    pub vault_id: String,
    pub dek: Arc<SecretKey>,
    pub store: Arc<VaultStore>,
}

struct Session {
    vault_id: String,
    dek: Arc<SecretKey>,
    store: Arc<VaultStore>,
    token_hash: blake3::Hash,
    last_activity: Instant,
    /// `None` disables auto-lock.
    auto_lock: Option<Duration>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl Session {
    fn is_expired(&self, now: Instant) -> bool {
        match self.auto_lock {
            Some(timeout) => now.duration_since(self.last_activity) >= timeout,
            None => false,
        }
    }

    fn auto_lock_minutes(&self) -> u32 {
        self.auto_lock.map(|d| (d.as_secs() / 60) as u32).unwrap_or(0)
    }

    fn handle(&self) -> SessionHandle {
        SessionHandle {
            vault_id: self.vault_id.clone(),
            dek: self.dek.clone(),
            store: self.store.clone(),
        }
    }

    /// Close the store and release the key. `abort_timer` is false when
    /// the timer task itself is tearing the session down.
    async fn shutdown(mut self, abort_timer: bool, reason: LockReason) {
        if let Some(timer) = self.timer.take() {
            if abort_timer {
                timer.abort();
            }
        }
        self.store.close().await;
        info!("[session] locked vault={} reason={:?}", self.vault_id, reason);
        // `self.dek` drops here; the key is wiped once the last handle goes.
    }
}

enum State {
    Locked,
    Unlocking { vault_id: String, attempt: u64 },
    Unlocked(Session),
}

struct Inner {
    state: State,
    generation: u64,
    attempts: u64,
}

/// An unlock in progress. Dropping it before `complete_unlock` (a failed
/// or cancelled unlock) returns the session to `Locked`.
#[must_use]
pub struct PendingUnlock {
    inner: Arc<RwLock<Inner>>,
    vault_id: String,
    attempt: u64,
    settled: bool,
}

impl PendingUnlock {
    pub fn vault_id(&self) -> &str {
        &self.vault_id
    }
}

impl fmt::Debug for PendingUnlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingUnlock")
            .field("vault_id", &self.vault_id)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

impl Drop for PendingUnlock {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let attempt = self.attempt;
        let contended = match self.inner.try_write() {
            Ok(mut guard) => {
                release_unlocking(&mut guard, attempt);
                false
            }
            Err(_) => true,
        };
        if contended {
            let inner = self.inner.clone();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    release_unlocking(&mut *inner.write().await, attempt);
                });
            }
        }
    }
}

/// Unlocking → Locked, but only for the attempt that is still current.
fn release_unlocking(inner: &mut Inner, attempt: u64) {
    if matches!(&inner.state, State::Unlocking { attempt: current, .. } if *current == attempt) {
        inner.state = State::Locked;
        debug!("[session] unlock attempt={} abandoned", attempt);
    }
}

/// Thread-safe session handle. Clone to share.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<RwLock<Inner>>,
    limiter: Arc<Mutex<RateLimiter>>,
}

impl SessionManager {
    pub fn new(max_unlock_attempts: u32, unlock_window: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                state: State::Locked,
                generation: 0,
                attempts: 0,
            })),
            limiter: Arc::new(Mutex::new(RateLimiter::new(max_unlock_attempts, unlock_window))),
        }
    }

    /// Count an unlock attempt. Must run before any key derivation.
    pub fn check_unlock_rate(&self) -> Result<(), VaultError> {
        self.limiter.lock().check(Instant::now()).map_err(|retry| {
            warn!("[session] unlock rate limit hit (retry in {}s)", retry.as_secs());
            VaultError::RateLimited { retry_after_secs: retry.as_secs().max(1) }
        })
    }

    pub async fn phase(&self) -> SessionPhase {
        match self.inner.read().await.state {
            State::Locked => SessionPhase::Locked,
            State::Unlocking { .. } => SessionPhase::Unlocking,
            State::Unlocked(_) => SessionPhase::Unlocked,
        }
    }

    /// Id of the unlocked vault, if any. Does not count as activity.
    pub async fn current_vault_id(&self) -> Option<String> {
        match &self.inner.read().await.state {
            State::Unlocked(s) if !s.is_expired(Instant::now()) => Some(s.vault_id.clone()),
            _ => None,
        }
    }

    pub async fn auto_lock_minutes(&self) -> Option<u32> {
        match &self.inner.read().await.state {
            State::Unlocked(s) => Some(s.auto_lock_minutes()),
            _ => None,
        }
    }

    /// Move Locked → Unlocking for `vault_id`.
    pub async fn begin_unlock(&self, vault_id: &str) -> Result<UnlockMode, VaultError> {
        self.expire_if_idle().await;
        let mut guard = self.inner.write().await;
        let settled = match &guard.state {
            State::Locked => None,
            State::Unlocking { vault_id: other, .. } => Some(Err(VaultError::SessionActive(
                format!("unlock of '{other}' already in progress"),
            ))),
            State::Unlocked(s) if s.vault_id == vault_id => Some(Ok(UnlockMode::Reauthenticate)),
            State::Unlocked(s) => Some(Err(VaultError::SessionActive(format!(
                "vault '{}' is unlocked; lock it first",
                s.vault_id
            )))),
        };
        if let Some(outcome) = settled {
            return outcome;
        }

        guard.attempts += 1;
        let attempt = guard.attempts;
        guard.state = State::Unlocking { vault_id: vault_id.to_string(), attempt };
        debug!("[session] unlocking vault={} attempt={}", vault_id, attempt);
        Ok(UnlockMode::Fresh(PendingUnlock {
            inner: self.inner.clone(),
            vault_id: vault_id.to_string(),
            attempt,
            settled: false,
        }))
    }

    /// Unlocking → Locked after a failed unlock.
    pub async fn abort_unlock(&self, mut pending: PendingUnlock) {
        let mut guard = self.inner.write().await;
        pending.settled = true;
        release_unlocking(&mut guard, pending.attempt);
    }

    /// Unlocking → Unlocked. Returns the session token; only its hash is kept.
    ///
    /// Fails with `VaultLocked` (and closes `store`) if the session was locked
    /// while the unlock was in progress.
    pub async fn complete_unlock(
        &self,
        mut pending: PendingUnlock,
        dek: Arc<SecretKey>,
        store: Arc<VaultStore>,
        auto_lock_minutes: u32,
    ) -> Result<String, VaultError> {
        let mut guard = self.inner.write().await;
        pending.settled = true;
        let current = matches!(
            &guard.state,
            State::Unlocking { attempt, .. } if *attempt == pending.attempt
        );
        if !current {
            drop(guard);
            store.close().await;
            return Err(VaultError::VaultLocked);
        }
        let vault_id = pending.vault_id.as_str();

        guard.generation += 1;
        let generation = guard.generation;
        let auto_lock = minutes_to_timeout(auto_lock_minutes);
        let (token, token_hash) = new_token();
        let timer = auto_lock.map(|_| spawn_timer(Arc::downgrade(&self.inner), generation));

        guard.state = State::Unlocked(Session {
            vault_id: vault_id.to_string(),
            dek,
            store,
            token_hash,
            last_activity: Instant::now(),
            auto_lock,
            generation,
            timer,
        });
        info!("[session] unlocked vault={} auto_lock_minutes={}", vault_id, auto_lock_minutes);
        Ok(token)
    }

    /// Issue a fresh token for the already-unlocked `vault_id`.
    pub async fn reauthenticate(&self, vault_id: &str) -> Result<String, VaultError> {
        let mut guard = self.inner.write().await;
        match &mut guard.state {
            State::Unlocked(s) if s.vault_id == vault_id && !s.is_expired(Instant::now()) => {
                let (token, hash) = new_token();
                s.token_hash = hash;
                s.last_activity = Instant::now();
                info!("[session] re-authenticated vault={}", vault_id);
                Ok(token)
            }
            _ => Err(VaultError::VaultLocked),
        }
    }

    /// Entry point for every vault operation: fails with `VaultLocked` when
    /// there is no session or it has idled out, otherwise records activity.
    pub async fn acquire(&self) -> Result<SessionHandle, VaultError> {
        let mut guard = self.inner.write().await;
        let now = Instant::now();
        match &mut guard.state {
            State::Unlocked(s) if !s.is_expired(now) => {
                s.last_activity = now;
                return Ok(s.handle());
            }
            State::Unlocked(_) => {}
            _ => return Err(VaultError::VaultLocked),
        }

        if let State::Unlocked(session) = std::mem::replace(&mut guard.state, State::Locked) {
            drop(guard);
            session.shutdown(true, LockReason::Inactivity).await;
        }
        Err(VaultError::VaultLocked)
    }

    pub async fn verify_token(&self, token: &str) -> Result<(), VaultError> {
        let candidate = blake3::hash(token.as_bytes());
        // `blake3::Hash` equality is constant-time.
        let matches = matches!(
            &self.inner.read().await.state,
            State::Unlocked(s) if s.token_hash == candidate
        );
        if !matches {
            return Err(VaultError::VaultLocked);
        }
        self.acquire().await.map(|_| ())
    }

    /// Change the inactivity timeout of the current session. 0 disables it.
    pub async fn set_auto_lock(&self, minutes: u32) -> Result<(), VaultError> {
        let mut guard = self.inner.write().await;
        let State::Unlocked(session) = &mut guard.state else {
            return Err(VaultError::VaultLocked);
        };
        if let Some(timer) = session.timer.take() {
            timer.abort();
        }
        session.auto_lock = minutes_to_timeout(minutes);
        session.last_activity = Instant::now();
        if session.auto_lock.is_some() {
            session.timer = Some(spawn_timer(Arc::downgrade(&self.inner), session.generation));
        }
        info!("[session] auto-lock set to {} minutes", minutes);
        Ok(())
    }

    /// End the session. Idempotent; returns whether a session was ended.
    pub async fn lock(&self, reason: LockReason) -> bool {
        let mut guard = self.inner.write().await;
        match std::mem::replace(&mut guard.state, State::Locked) {
            State::Unlocked(session) => {
                drop(guard);
                session.shutdown(true, reason).await;
                true
            }
            State::Unlocking { vault_id, .. } => {
                debug!("[session] lock during unlock of vault={}", vault_id);
                true
            }
            State::Locked => false,
        }
    }

    async fn expire_if_idle(&self) {
        let mut guard = self.inner.write().await;
        let expired = matches!(&guard.state, State::Unlocked(s) if s.is_expired(Instant::now()));
        if !expired {
            return;
        }
        if let State::Unlocked(session) = std::mem::replace(&mut guard.state, State::Locked) {
            drop(guard);
            session.shutdown(true, LockReason::Inactivity).await;
        }
    }
}

fn minutes_to_timeout(minutes: u32) -> Option<Duration> {
    (minutes > 0).then(|| Duration::from_secs(u64::from(minutes) * 60))
}

fn new_token() -> (String, blake3::Hash) {
    let mut raw = [0u8; TOKEN_LEN];
    rand::thread_rng().fill_bytes(&mut raw);
    let token = hex::encode(raw);
    let hash = blake3::hash(token.as_bytes());
    (token, hash)
}

/// Sleeps until the current deadline, re-reading it after every wake since
/// activity moves it forward. Exits when the session it was spawned for is
/// gone.
fn spawn_timer(inner: Weak<RwLock<Inner>>, generation: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Some(strong) = inner.upgrade() else {
                return;
            };
            let deadline = {
                let guard = strong.read().await;
                match &guard.state {
                    State::Unlocked(s) if s.generation == generation => match s.auto_lock {
                        Some(timeout) => s.last_activity + timeout,
                        None => return,
                    },
                    _ => return,
                }
            };

            if Instant::now() < deadline {
                drop(strong);
                tokio::time::sleep_until(deadline).await;
                continue;
            }

            let mut guard = strong.write().await;
            let still_due = matches!(
                &guard.state,
                State::Unlocked(s) if s.generation == generation && s.is_expired(Instant::now())
            );
            if !still_due {
                continue;
            }
            if let State::Unlocked(session) = std::mem::replace(&mut guard.state, State::Locked) {
                drop(guard);
                session.shutdown(false, LockReason::Inactivity).await;
            }
            return;
        }
    })
}

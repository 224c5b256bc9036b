use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cleanup::CleanupTracker;
use crate::config::{RegistryOptions, SessionConfig};
use crate::error::SessionError;
use crate::event_log;
use crate::session::{CodeOutput, Session, ShellOutput};
use crate::timers::IdleTimers;

const INSTANCE_ID_LEN: usize = 8;
const SUFFIX_LEN: usize = 8;

/// One line of [`SessionRegistry::list_sessions`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub created_at: SystemTime,
    pub last_used: SystemTime,
    pub remaining: Option<Duration>,
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub active: usize,
    pub expired: usize,
}

struct RegistryInner {
    process_id: u32,
    instance: String,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    timers: Arc<IdleTimers>,
    tracker: Arc<CleanupTracker>,
    sweep_interval: Duration,
}

/// Owns every session created through it and evicts the idle ones.
///
/// Eviction runs on a background thread woken by the earliest idle deadline,
/// with a periodic full sweep as a backstop. Session ids carry the owning
/// process id, so registries in different processes never collide.
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionRegistry {
    pub fn new(process_id: u32) -> Self {
        Self::with_options(process_id, RegistryOptions::default())
    }

    pub fn for_current_process() -> Self {
        Self::new(std::process::id())
    }

    pub fn with_options(process_id: u32, options: RegistryOptions) -> Self {
        let instance = Uuid::new_v4().simple().to_string()[..INSTANCE_ID_LEN].to_string();
        let inner = Arc::new(RegistryInner {
            process_id,
            instance,
            sessions: RwLock::new(HashMap::new()),
            timers: Arc::new(IdleTimers::new()),
            tracker: options.tracker.unwrap_or_else(CleanupTracker::global),
            sweep_interval: options.sweep_interval,
        });
        let sweeper = spawn_sweeper(Arc::downgrade(&inner), inner.timers.clone(), inner.sweep_interval);
        if sweeper.is_none() {
            warn!("idle sweeper could not be started; sessions expire only on access");
        }
        Self {
            inner,
            sweeper: Mutex::new(sweeper),
        }
    }

    pub fn process_id(&self) -> u32 {
        self.inner.process_id
    }

    /// Creates a session with a fresh `p{pid}_{instance}_{suffix}` id.
    pub fn create_session(&self, config: SessionConfig) -> Result<Arc<Session>, SessionError> {
        let suffix = Uuid::new_v4().simple().to_string()[..SUFFIX_LEN].to_string();
        let id = format!("{}{suffix}", self.inner.id_prefix());
        self.insert(id, config)
    }

    /// Creates a session under a caller-chosen id.
    pub fn create_named_session(
        &self,
        id: impl Into<String>,
        config: SessionConfig,
    ) -> Result<Arc<Session>, SessionError> {
        self.insert(id.into(), config)
    }

    /// Looks up a live session, evicting it instead if it has expired.
    pub fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        let session = self.inner.read().get(id).cloned()?;
        if session.is_expired() {
            self.inner.evict_if_expired(id);
            return None;
        }
        session.touch();
        Some(session)
    }

    pub fn get_or_create(&self, id: &str, config: SessionConfig) -> Result<Arc<Session>, SessionError> {
        if let Some(session) = self.get_session(id) {
            return Ok(session);
        }
        match self.create_named_session(id, config.clone()) {
            Err(SessionError::DuplicateId(_)) => self
                .get_session(id)
                .ok_or_else(|| SessionError::Expired(id.to_string())),
            other => other,
        }
    }

    /// Removes and cleans up a session. Returns whether it existed.
    pub fn remove_session(&self, id: &str) -> bool {
        let Some(session) = self.inner.write().remove(id) else {
            return false;
        };
        session.cleanup();
        info!(session = %id, "session removed");
        true
    }

    /// Non-expired sessions owned by this process.
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .inner
            .read()
            .values()
            .filter(|session| self.inner.owns(session.id()))
            .filter(|session| !session.is_expired())
            .map(|session| {
                let info = session.info();
                SessionSummary {
                    id: info.id,
                    created_at: info.created_at,
                    last_used: info.last_used,
                    remaining: info.remaining,
                    idle_timeout: info.idle_timeout,
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        summaries
    }

    pub fn extend_session_timeout(&self, id: &str, minutes: u64) -> Result<Duration, SessionError> {
        self.require(id)?.extend_timeout(minutes)
    }

    pub fn exec_bash(
        &self,
        id: &str,
        command: &str,
        timeout_secs: u64,
        requirements: &[String],
    ) -> Result<ShellOutput, SessionError> {
        self.require(id)?.exec_bash(command, timeout_secs, requirements)
    }

    /// Runs `code` in a throwaway single-use session.
    pub fn run_isolated(
        &self,
        config: SessionConfig,
        code: &str,
        requirements: &[String],
    ) -> Result<CodeOutput, SessionError> {
        let config = SessionConfig {
            idle_timeout: Duration::ZERO,
            ..config
        };
        let session = self.create_session(config)?;
        let id = session.id().to_string();
        let result = session.run_code(code, requirements);
        self.remove_session(&id);
        // The sweeper may have taken it first; wait for its teardown.
        session.cleanup();
        result
    }

    pub fn stats(&self) -> RegistryStats {
        let sessions = self.inner.read();
        let expired = sessions.values().filter(|s| s.is_expired()).count();
        RegistryStats {
            total: sessions.len(),
            active: sessions.len() - expired,
            expired,
        }
    }

    /// Evicts every expired session now. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        self.inner.sweep_expired()
    }

    /// Stops the sweeper and cleans up every session. Idempotent.
    pub fn shutdown(&self) {
        self.inner.timers.stop();
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            warn!("idle sweeper panicked");
        }
        let sessions: Vec<Arc<Session>> = self.inner.write().drain().map(|(_, s)| s).collect();
        if !sessions.is_empty() {
            info!(count = sessions.len(), "cleaning up sessions at shutdown");
        }
        for session in sessions {
            session.cleanup();
        }
    }

    fn insert(&self, id: String, config: SessionConfig) -> Result<Arc<Session>, SessionError> {
        // Held across creation so two callers cannot race on the same id.
        let mut sessions = self.inner.write();
        if sessions.contains_key(&id) {
            return Err(SessionError::DuplicateId(id));
        }
        let session = Session::create_with(
            id.clone(),
            config,
            self.inner.tracker.clone(),
            Some(self.inner.timers.clone()),
        )?;
        sessions.insert(id, session.clone());
        Ok(session)
    }

    fn require(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        if let Some(session) = self.get_session(id) {
            return Ok(session);
        }
        Err(SessionError::Expired(id.to_string()))
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl RegistryInner {
    fn id_prefix(&self) -> String {
        format!("{}{}_", self.process_prefix(), self.instance)
    }

    fn process_prefix(&self) -> String {
        format!("p{}_", self.process_id)
    }

    /// Generated ids name their process; caller-chosen ids are always ours.
    fn owns(&self, id: &str) -> bool {
        match id.strip_prefix('p').and_then(|rest| rest.split_once('_')) {
            Some((pid, _)) if !pid.is_empty() && pid.bytes().all(|b| b.is_ascii_digit()) => {
                pid.parse::<u32>().is_ok_and(|pid| pid == self.process_id)
            }
            _ => true,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn evict_if_expired(&self, id: &str) -> bool {
        let session = {
            let mut sessions = self.write();
            match sessions.get(id) {
                Some(session) if session.is_expired() => sessions.remove(id),
                _ => None,
            }
        };
        let Some(session) = session else {
            return false;
        };
        session.cleanup();
        info!(session = %id, "evicted idle session");
        event_log::log("session_evicted", json!({ "session_id": id }));
        true
    }

    fn sweep_expired(&self) -> usize {
        let candidates: Vec<String> = self
            .read()
            .iter()
            .filter(|(id, session)| self.owns(id) && session.is_expired())
            .map(|(id, _)| id.clone())
            .collect();
        candidates
            .iter()
            .filter(|id| self.evict_if_expired(id))
            .count()
    }
}

fn spawn_sweeper(
    inner: Weak<RegistryInner>,
    timers: Arc<IdleTimers>,
    interval: Duration,
) -> Option<JoinHandle<()>> {
    thread::Builder::new()
        .name("sandbox-sweeper".to_string())
        .spawn(move || {
            let mut next_sweep = Instant::now() + interval;
            while let Some(due) = timers.wait_due(next_sweep) {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                for id in due {
                    inner.evict_if_expired(&id);
                }
                if Instant::now() >= next_sweep {
                    let evicted = inner.sweep_expired();
                    if evicted > 0 {
                        debug!(evicted, "periodic sweep");
                    }
                    next_sweep = Instant::now() + interval;
                }
            }
        })
        .ok()
}

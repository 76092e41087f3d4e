//! Console session registry with per-user admission limits.
//!
//! Every established tunnel is registered here between the TCP dial and the
//! start of relaying. Admission enforces two limits per user: a sliding
//! reconnect window and a cap on concurrent sessions.

use crate::auth::RateLimiter;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use vmgate_core::{ErrorCode, ErrorEnvelope, Principal};

#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub max_sessions_per_user: usize,
    /// Admissions allowed per user within `reconnect_window`.
    pub reconnect_limit: u32,
    pub reconnect_window: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_sessions_per_user: 2,
            reconnect_limit: 3,
            reconnect_window: Duration::from_secs(30),
        }
    }
}

/// One live console tunnel.
#[derive(Debug, Clone)]
pub struct ConsoleSession {
    pub id: String,
    pub user_id: u64,
    pub username: String,
    pub vm_uuid: String,
    pub remote_addr: Option<SocketAddr>,
    pub started_at: Instant,
}

pub struct ConsoleSessionManager {
    sessions: RwLock<HashMap<String, ConsoleSession>>,
    reconnects: Mutex<RateLimiter>,
    limits: SessionLimits,
}

impl ConsoleSessionManager {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            reconnects: Mutex::new(RateLimiter::new(limits.reconnect_limit, limits.reconnect_window)),
            limits,
        }
    }

    /// Admit a new session for `principal`, or return the error envelope to
    /// send to the client.
    pub async fn admit(
        &self,
        principal: &Principal,
        vm_uuid: &str,
        remote_addr: Option<SocketAddr>,
    ) -> Result<ConsoleSession, ErrorEnvelope> {
        let mut sessions = self.sessions.write().await;
        let active = sessions
            .values()
            .filter(|s| s.user_id == principal.user_id)
            .count();
        if active >= self.limits.max_sessions_per_user {
            warn!(
                user_id = principal.user_id,
                username = %principal.username,
                active,
                "console session limit exceeded"
            );
            return Err(ErrorEnvelope::new(ErrorCode::SessionLimitExceeded)
                .with_vm_uuid(vm_uuid)
                .with_message(format!(
                    "Maximum of {} concurrent console sessions reached. Close another console and try again.",
                    self.limits.max_sessions_per_user
                )));
        }

        // Only admissions that pass the concurrency cap count as reconnects.
        let key = principal.user_id.to_string();
        if !self.reconnects.lock().await.check_and_record(&key) {
            warn!(
                user_id = principal.user_id,
                username = %principal.username,
                vm_uuid = %vm_uuid,
                "console reconnect limit exceeded"
            );
            return Err(ErrorEnvelope::new(ErrorCode::ReconnectLimitExceeded)
                .with_vm_uuid(vm_uuid)
                .with_message(format!(
                    "Too many reconnection attempts. Please wait {} seconds and try again.",
                    self.limits.reconnect_window.as_secs()
                )));
        }

        let session = ConsoleSession {
            id: generate_session_id(),
            user_id: principal.user_id,
            username: principal.username.clone(),
            vm_uuid: vm_uuid.to_string(),
            remote_addr,
            started_at: Instant::now(),
        };
        sessions.insert(session.id.clone(), session.clone());
        info!(
            session_id = %session.id,
            user_id = session.user_id,
            username = %session.username,
            vm_uuid = %session.vm_uuid,
            remote = ?session.remote_addr,
            total = sessions.len(),
            "console session started"
        );
        Ok(session)
    }

    /// Remove a session. Unknown ids are ignored.
    pub async fn end(&self, id: &str, reason: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.remove(id) {
            info!(
                session_id = %id,
                user_id = session.user_id,
                vm_uuid = %session.vm_uuid,
                duration_secs = session.started_at.elapsed().as_secs(),
                reason = %reason,
                total = sessions.len(),
                "console session ended"
            );
        }
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Drop expired reconnect records.
    pub async fn gc(&self) {
        let mut reconnects = self.reconnects.lock().await;
        reconnects.gc();
        debug!(tracked = reconnects.tracked_keys(), "reconnect records pruned");
    }
}

fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

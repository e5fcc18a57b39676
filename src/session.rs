//! Per-user session tracking.
//!
//! Chunk results are grouped into sessions by inter-arrival gap: a chunk
//! whose timestamp is more than the gap threshold after the user's most
//! recent chunk starts a new session. Sessions live in memory only and are
//! reaped by the aggregator's cleanup pass.

use crate::results::ChunkResult;
use chrono::{DateTime, Duration, FixedOffset};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

/// One session: a maximal run of chunks with inter-arrival gaps within the
/// threshold.
#[derive(Debug, Clone)]
struct Session {
    start: DateTime<FixedOffset>,
    last_chunk: DateTime<FixedOffset>,
    results: Vec<ChunkResult>,
}

#[derive(Default)]
struct UserSessions {
    sessions: HashMap<String, Session>,
}

/// Tracks sessions for all users.
///
/// A coarse top-level mutex guards user-map creation; a per-user mutex
/// serialises all appends and reads for that user.
pub struct SessionTracker {
    users: Mutex<HashMap<Uuid, Arc<Mutex<UserSessions>>>>,
    gap_threshold: Duration,
}

impl SessionTracker {
    /// Create a tracker with the given session gap threshold.
    pub fn new(gap_threshold: Duration) -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
            gap_threshold,
        }
    }

    fn user_entry(&self, user_id: Uuid) -> Arc<Mutex<UserSessions>> {
        let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(users.entry(user_id).or_default())
    }

    /// Derive a session id from the user and the first chunk's wall time.
    ///
    /// Known wrinkle: a single user whose chunks split sessions within the
    /// same wall-clock second produces a colliding id, and the second chunk
    /// simply joins the existing session.
    fn session_id(user_id: Uuid, t: DateTime<FixedOffset>) -> String {
        format!("{user_id}_{}", t.format("%Y%m%d_%H%M%S"))
    }

    /// Append a result to the user's current session (or a new one when the
    /// gap threshold is exceeded). Returns the session id.
    ///
    /// Out-of-order arrivals are allowed: a timestamp behind the session's
    /// last chunk reuses the session and leaves `last_chunk` at the maximum.
    pub fn add_result(&self, user_id: Uuid, result: ChunkResult) -> String {
        let entry = self.user_entry(user_id);
        let mut user = entry.lock().unwrap_or_else(|e| e.into_inner());

        let most_recent = user
            .sessions
            .iter()
            .max_by_key(|(_, s)| s.last_chunk)
            .map(|(id, s)| (id.clone(), s.last_chunk));

        let session_id = match most_recent {
            Some((id, last_chunk))
                if result.captured_at - last_chunk <= self.gap_threshold =>
            {
                id
            }
            Some((_, last_chunk)) => {
                let id = Self::session_id(user_id, result.captured_at);
                debug!(
                    "gap of {}s exceeds threshold, new session {id}",
                    (result.captured_at - last_chunk).num_seconds()
                );
                id
            }
            None => Self::session_id(user_id, result.captured_at),
        };

        let captured_at = result.captured_at;
        let session = user
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| Session {
                start: captured_at,
                last_chunk: captured_at,
                results: Vec::new(),
            });
        session.results.push(result);
        session.last_chunk = session.last_chunk.max(captured_at);

        session_id
    }

    /// Snapshot of all sessions with results inside `[window_start,
    /// window_end]` (inclusive on both ends), keyed user → session →
    /// in-window results. The returned data is a copy; later appends do not
    /// mutate it.
    pub fn active_sessions_in_window(
        &self,
        window_start: DateTime<FixedOffset>,
        window_end: DateTime<FixedOffset>,
    ) -> HashMap<Uuid, HashMap<String, Vec<ChunkResult>>> {
        let entries: Vec<(Uuid, Arc<Mutex<UserSessions>>)> = {
            let users = self.users.lock().unwrap_or_else(|e| e.into_inner());
            users.iter().map(|(u, e)| (*u, Arc::clone(e))).collect()
        };

        let mut active = HashMap::new();
        for (user_id, entry) in entries {
            let user = entry.lock().unwrap_or_else(|e| e.into_inner());
            for (session_id, session) in &user.sessions {
                let in_window: Vec<ChunkResult> = session
                    .results
                    .iter()
                    .filter(|r| r.captured_at >= window_start && r.captured_at <= window_end)
                    .cloned()
                    .collect();
                if !in_window.is_empty() {
                    active
                        .entry(user_id)
                        .or_insert_with(HashMap::new)
                        .insert(session_id.clone(), in_window);
                }
            }
        }
        active
    }

    /// Drop whole sessions whose last chunk is strictly older than `cutoff`.
    /// A session whose last chunk is exactly at the cutoff survives.
    pub fn cleanup_older_than(&self, user_id: Uuid, cutoff: DateTime<FixedOffset>) {
        let entry = {
            let users = self.users.lock().unwrap_or_else(|e| e.into_inner());
            users.get(&user_id).map(Arc::clone)
        };
        let Some(entry) = entry else {
            return;
        };

        let mut user = entry.lock().unwrap_or_else(|e| e.into_inner());
        let before = user.sessions.len();
        user.sessions.retain(|_, s| s.last_chunk >= cutoff);
        let removed = before - user.sessions.len();
        if removed > 0 {
            debug!("cleaned up {removed} stale sessions for user {user_id}");
        }
    }

    /// Copy of all sessions for one user (debug/test views).
    pub fn all_sessions(&self, user_id: Uuid) -> HashMap<String, Vec<ChunkResult>> {
        let entry = {
            let users = self.users.lock().unwrap_or_else(|e| e.into_inner());
            users.get(&user_id).map(Arc::clone)
        };
        let Some(entry) = entry else {
            return HashMap::new();
        };
        let user = entry.lock().unwrap_or_else(|e| e.into_inner());
        user.sessions
            .iter()
            .map(|(id, s)| (id.clone(), s.results.clone()))
            .collect()
    }

    /// Session start time, for ordering assertions in tests and debug views.
    pub fn session_start(&self, user_id: Uuid, session_id: &str) -> Option<DateTime<FixedOffset>> {
        let entry = {
            let users = self.users.lock().unwrap_or_else(|e| e.into_inner());
            users.get(&user_id).map(Arc::clone)
        };
        let entry = entry?;
        let user = entry.lock().unwrap_or_else(|e| e.into_inner());
        user.sessions.get(session_id).map(|s| s.start)
    }
}

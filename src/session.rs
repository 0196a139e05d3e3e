use crate::clock::Clock;
use crate::storage::{KeyValueStore, SharedStore, TabStore};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Persistent key holding the serialized tab-id -> session mapping.
pub const SESSIONS_KEY: &str = "userSessions";
/// Per-tab key caching the tab identifier.
pub const TAB_ID_KEY: &str = "tabId";
/// Per-tab presence flag set while a session is active.
pub const WAS_LOGGED_IN_KEY: &str = "wasLoggedIn";

/// Default eviction age for stale sessions: 24 hours.
pub const SESSION_MAX_AGE_MS: i64 = 24 * 60 * 60 * 1000;
/// Minimum spacing between persisted activity updates.
pub const ACTIVITY_THROTTLE_MS: i64 = 60 * 1000;

/// Role carried by every session record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    User,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::User => "user",
        }
    }

    /// Strict parse of the wire value. Anything other than the two known
    /// role names is rejected; callers decide whether that means an invalid
    /// record (treated as absent) or an input error.
    pub fn parse(raw: &str) -> Option<UserRole> {
        match raw {
            "admin" => Some(UserRole::Admin),
            "user" => Some(UserRole::User),
            _ => None,
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One authenticated context, keyed by the tab that owns it.
///
/// Serialized as camelCase JSON inside the registry blob. Profile fields
/// beyond the identity triple are optional on the wire and default to empty.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    #[serde(default)]
    pub tab_id: String,
    pub user_id: String,
    pub username: String,
    pub user_role: UserRole,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub login_time: i64,
    #[serde(default)]
    pub last_active: i64,
}

impl SessionRecord {
    /// Identity invariant: a stored record with an empty user id or
    /// username is treated as absent rather than surfaced.
    pub fn is_valid(&self) -> bool {
        !self.user_id.is_empty() && !self.username.is_empty()
    }

    pub fn is_admin(&self) -> bool {
        self.user_role == UserRole::Admin
    }

    /// Timestamp used for age-based eviction: lastActive, falling back to
    /// loginTime, falling back to 0 (always stale).
    pub fn age_reference(&self) -> i64 {
        if self.last_active > 0 {
            self.last_active
        } else {
            self.login_time
        }
    }
}

/// Diagnostic projection of one registry entry.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub tab_id: String,
    pub is_current: bool,
    pub username: String,
    pub user_role: UserRole,
    pub login_time: i64,
    pub last_active: i64,
}

/// Parse the registry blob, dropping anything unreadable.
///
/// A blob that is not valid JSON yields an empty map. A record that fails
/// to deserialize, or that violates the identity invariant, is skipped
/// individually without affecting its neighbours.
fn parse_registry(raw: &str) -> HashMap<String, SessionRecord> {
    let parsed: HashMap<String, serde_json::Value> = match serde_json::from_str(raw) {
        Ok(map) => map,
        Err(e) => {
            log::warn!("session registry blob is not valid JSON, treating as empty: {}", e);
            return HashMap::new();
        }
    };

    parsed
        .into_iter()
        .filter_map(|(tab_id, value)| match serde_json::from_value::<SessionRecord>(value) {
            Ok(record) if record.is_valid() => Some((tab_id, record)),
            Ok(_) => {
                log::debug!("dropping session record with empty identity for {}", tab_id);
                None
            }
            Err(e) => {
                log::debug!("dropping unreadable session record for {}: {}", tab_id, e);
                None
            }
        })
        .collect()
}

fn ensure_tab_id(tab: &TabStore, clock: &dyn Clock) -> String {
    if let Some(existing) = tab.get(TAB_ID_KEY) {
        return existing;
    }
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(char::from)
        .collect::<String>()
        .to_lowercase();
    let id = format!("tab_{}_{}", clock.now_ms(), suffix);
    tab.set(TAB_ID_KEY, &id);
    id
}

/// The shared tab-id -> session mapping, seen from one tab.
///
/// All operations are synchronous read/modify/write cycles over the
/// serialized blob. The cycle is not atomic across tabs; concurrent
/// updates resolve last-write-wins at blob granularity, which is accepted
/// given the low update frequency.
pub struct SessionRegistry {
    persistent: SharedStore,
    tab: Arc<TabStore>,
    clock: Arc<dyn Clock>,
    tab_id: String,
}

impl SessionRegistry {
    /// Bind a registry view to one tab. Generates and caches the tab id on
    /// first use; the returned registry writes to the shared store under
    /// that identity.
    pub fn new(profile: &SharedStore, tab: Arc<TabStore>, clock: Arc<dyn Clock>) -> Self {
        let tab_id = ensure_tab_id(tab.as_ref(), clock.as_ref());
        let persistent = profile.handle_for(&tab_id);
        SessionRegistry {
            persistent,
            tab,
            clock,
            tab_id,
        }
    }

    /// Stable identifier of the owning tab.
    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    pub fn tab_store(&self) -> &TabStore {
        self.tab.as_ref()
    }

    /// Shared-store handle attributed to this tab.
    pub fn persistent(&self) -> &SharedStore {
        &self.persistent
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// The full mapping. Absent or malformed storage reads as empty.
    pub fn all_sessions(&self) -> HashMap<String, SessionRecord> {
        match self.persistent.get(SESSIONS_KEY) {
            Some(raw) => parse_registry(&raw),
            None => HashMap::new(),
        }
    }

    pub fn save_sessions(&self, sessions: &HashMap<String, SessionRecord>) {
        match serde_json::to_string(sessions) {
            Ok(raw) => self.persistent.set(SESSIONS_KEY, &raw),
            Err(e) => log::error!("failed to serialize session registry: {}", e),
        }
    }

    /// This tab's session, if any, annotated with the tab id.
    pub fn current_user(&self) -> Option<SessionRecord> {
        let mut record = self.all_sessions().remove(&self.tab_id)?;
        record.tab_id = self.tab_id.clone();
        Some(record)
    }

    /// Bump lastActive for this tab's record, if one exists.
    pub fn update_activity(&self) {
        let mut sessions = self.all_sessions();
        if let Some(record) = sessions.get_mut(&self.tab_id) {
            record.last_active = self.clock.now_ms();
            self.save_sessions(&sessions);
        }
    }

    /// Evict other tabs' records older than `max_age_ms`. This tab's own
    /// record is never evicted regardless of age. Returns the number of
    /// records removed; the blob is rewritten only when that is non-zero.
    pub fn cleanup_old_sessions(&self, max_age_ms: i64) -> usize {
        let cutoff = self.clock.now_ms() - max_age_ms;
        let mut sessions = self.all_sessions();
        let before = sessions.len();
        sessions.retain(|tab_id, record| tab_id == &self.tab_id || record.age_reference() >= cutoff);
        let removed = before - sessions.len();
        if removed > 0 {
            self.save_sessions(&sessions);
            log::info!("evicted {} stale session record(s)", removed);
        }
        removed
    }

    /// Diagnostic walk over the registry, recomputed on every call.
    pub fn sessions_info(&self) -> impl Iterator<Item = SessionInfo> {
        let current = self.tab_id.clone();
        self.all_sessions().into_iter().map(move |(tab_id, record)| SessionInfo {
            is_current: tab_id == current,
            username: record.username,
            user_role: record.user_role,
            login_time: record.login_time,
            last_active: record.last_active,
            tab_id,
        })
    }
}

/// Throttles interaction signals down to one persisted activity update per
/// window. Pointer, keyboard and scroll events all funnel through here;
/// re-running early has no effect beyond the timestamp already written.
pub struct ActivityTracker {
    last_update: Mutex<i64>,
    throttle_ms: i64,
}

impl ActivityTracker {
    pub fn new(throttle_ms: i64) -> Self {
        ActivityTracker {
            last_update: Mutex::new(0),
            throttle_ms,
        }
    }

    /// Record an interaction. Returns true when the update was persisted,
    /// false when it was absorbed by the throttle window.
    pub fn touch(&self, registry: &SessionRegistry) -> bool {
        let now = registry.now_ms();
        let mut last = self.last_update.lock().unwrap();
        if now - *last < self.throttle_ms {
            return false;
        }
        *last = now;
        drop(last);
        registry.update_activity();
        true
    }
}

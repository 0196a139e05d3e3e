use crate::admin_storage::RoleStorage;
use crate::clock::Clock;
use crate::guard::{DenyReason, Navigator, PageKind, classify_page};
use crate::session::{
    ACTIVITY_THROTTLE_MS, ActivityTracker, SessionRecord, SessionRegistry, UserRole,
    WAS_LOGGED_IN_KEY,
};
use crate::storage::{KeyValueStore, SharedStore, StorageWatcher, TabStore};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Broadcast key carrying the last targeted logout. Not durable state:
/// each write supersedes the previous one.
pub const LOGOUT_SYNC_KEY: &str = "logout_sync";
/// Broadcast key carrying the time of the last logout-all.
pub const LOGOUT_SYNC_ALL_KEY: &str = "logout_sync_all";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// The login response cannot be normalized into a session record.
    /// Raised rather than absorbed so callers cannot proceed with a
    /// broken session.
    #[error("invalid login response: {0}")]
    InvalidInput(String),
}

/// Loosely-shaped login response as produced by the account layer or an
/// external API. Ids may arrive as strings or numbers, and every field may
/// appear either at the top level or nested under `user`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoginResponse {
    pub user_id: Option<serde_json::Value>,
    pub id: Option<serde_json::Value>,
    pub username: Option<String>,
    pub name: Option<String>,
    pub user_role: Option<String>,
    pub role: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub full_name: Option<String>,
    pub user: Option<NestedUser>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NestedUser {
    pub id: Option<serde_json::Value>,
    pub username: Option<String>,
    pub role: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub full_name: Option<String>,
}

impl LoginResponse {
    /// Minimal well-formed response, handy for tests and scenarios.
    pub fn with_identity(user_id: &str, username: &str, role: UserRole) -> Self {
        LoginResponse {
            user_id: Some(serde_json::Value::String(user_id.to_string())),
            username: Some(username.to_string()),
            user_role: Some(role.as_str().to_string()),
            ..LoginResponse::default()
        }
    }
}

fn id_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|s| !s.is_empty()).cloned()
}

/// Collapse a loosely-shaped login response into a session record.
///
/// Precedence, fixed and documented here once:
///   user id:   `userId`, then `user.id`, then `id`
///   username:  `username`, then `user.username`, then `name`
///   role:      `userRole`, then `user.role`, then `role`
///   email / phone / fullName: top level, then nested `user`
///
/// A response with no usable id, no username, or a role outside the known
/// set fails with `InvalidInput`. `loginTime`/`lastActive` are left at 0
/// for the caller to stamp.
pub fn normalize_login_response(response: &LoginResponse) -> Result<SessionRecord, AuthError> {
    let nested = response.user.as_ref();

    let user_id = response
        .user_id
        .as_ref()
        .and_then(id_string)
        .or_else(|| nested.and_then(|u| u.id.as_ref().and_then(id_string)))
        .or_else(|| response.id.as_ref().and_then(id_string))
        .ok_or_else(|| AuthError::InvalidInput("no user id in login response".to_string()))?;

    let username = non_empty(response.username.as_ref())
        .or_else(|| nested.and_then(|u| non_empty(u.username.as_ref())))
        .or_else(|| non_empty(response.name.as_ref()))
        .ok_or_else(|| AuthError::InvalidInput("no username in login response".to_string()))?;

    let raw_role = non_empty(response.user_role.as_ref())
        .or_else(|| nested.and_then(|u| non_empty(u.role.as_ref())))
        .or_else(|| non_empty(response.role.as_ref()))
        .ok_or_else(|| AuthError::InvalidInput("no user role in login response".to_string()))?;
    let user_role = UserRole::parse(&raw_role)
        .ok_or_else(|| AuthError::InvalidInput(format!("unrecognized user role {:?}", raw_role)))?;

    let email = non_empty(response.email.as_ref())
        .or_else(|| nested.and_then(|u| non_empty(u.email.as_ref())))
        .unwrap_or_default();
    let phone = non_empty(response.phone.as_ref())
        .or_else(|| nested.and_then(|u| non_empty(u.phone.as_ref())))
        .unwrap_or_default();
    let full_name = non_empty(response.full_name.as_ref())
        .or_else(|| nested.and_then(|u| non_empty(u.full_name.as_ref())))
        .unwrap_or_default();

    Ok(SessionRecord {
        tab_id: String::new(),
        user_id,
        username,
        user_role,
        email,
        phone,
        full_name,
        login_time: 0,
        last_active: 0,
    })
}

/// Payload written to the logout broadcast key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutSyncEvent {
    pub user_id: String,
    pub session_id: String,
    pub time: i64,
}

/// Lifecycle notifications delivered synchronously to registered listeners.
#[derive(Clone, Debug, PartialEq)]
pub enum AuthEvent {
    Login { user: SessionRecord, tab_id: String },
    Logout { user: SessionRecord, tab_id: String },
    LogoutAll,
    LogoutSync { user_id: String, tab_id: String },
}

type Listener = Box<dyn Fn(&AuthEvent) + Send + Sync>;

/// Per-tab authentication coordinator.
///
/// Owns this tab's view of the session registry, mirrors the active record
/// into the role-partitioned keys, and drives cross-tab logout
/// synchronization over the shared store's broadcast keys.
pub struct AuthManager {
    registry: SessionRegistry,
    roles: RoleStorage,
    watcher: StorageWatcher,
    activity: ActivityTracker,
    listeners: Mutex<Vec<Listener>>,
}

impl AuthManager {
    pub fn new(profile: &SharedStore, tab: Arc<TabStore>, clock: Arc<dyn Clock>) -> Self {
        let registry = SessionRegistry::new(profile, tab, clock);
        let watcher = registry
            .persistent()
            .watch(&[LOGOUT_SYNC_KEY, LOGOUT_SYNC_ALL_KEY]);
        let roles = RoleStorage::new(registry.persistent().clone());
        AuthManager {
            registry,
            roles,
            watcher,
            activity: ActivityTracker::new(ACTIVITY_THROTTLE_MS),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn role_storage(&self) -> &RoleStorage {
        &self.roles
    }

    pub fn on_event(&self, listener: impl Fn(&AuthEvent) + Send + Sync + 'static) {
        self.listeners.lock().unwrap().push(Box::new(listener));
    }

    fn emit(&self, event: AuthEvent) {
        for listener in self.listeners.lock().unwrap().iter() {
            listener(&event);
        }
    }

    /// Establish a session for this tab from a login response.
    ///
    /// Fully synchronous against the local store: normalizes the response,
    /// stamps loginTime/lastActive, writes the registry entry, sets the
    /// per-tab wasLoggedIn flag, mirrors the record under its role key and
    /// emits `Login`.
    pub fn login(&self, response: &LoginResponse) -> Result<SessionRecord, AuthError> {
        let mut record = normalize_login_response(response)?;
        let now = self.registry.now_ms();
        record.tab_id = self.registry.tab_id().to_string();
        record.login_time = now;
        record.last_active = now;

        let mut sessions = self.registry.all_sessions();
        sessions.insert(record.tab_id.clone(), record.clone());
        self.registry.save_sessions(&sessions);
        self.registry.tab_store().set(WAS_LOGGED_IN_KEY, "1");
        self.roles.set_user_data(&record);

        log::info!("{} logged in on {}", record.username, record.tab_id);
        self.emit(AuthEvent::Login {
            user: record.clone(),
            tab_id: record.tab_id.clone(),
        });
        Ok(record)
    }

    /// End this tab's session and broadcast the logout to sibling tabs.
    ///
    /// With no active session this is an expected no-op: a warning is
    /// logged and `false` returned, nothing is thrown.
    pub fn logout(&self) -> bool {
        let Some(user) = self.registry.current_user() else {
            log::warn!("logout called with no active session");
            return false;
        };

        let mut sessions = self.registry.all_sessions();
        sessions.remove(self.registry.tab_id());
        self.registry.save_sessions(&sessions);
        self.registry.tab_store().remove(WAS_LOGGED_IN_KEY);
        self.roles.clear_role(user.user_role.as_str());

        let broadcast = LogoutSyncEvent {
            user_id: user.user_id.clone(),
            session_id: self.registry.tab_id().to_string(),
            time: self.registry.now_ms(),
        };
        match serde_json::to_string(&broadcast) {
            Ok(raw) => self.registry.persistent().set(LOGOUT_SYNC_KEY, &raw),
            Err(e) => log::error!("failed to serialize logout broadcast: {}", e),
        }

        log::info!("{} logged out from {}", user.username, user.tab_id);
        self.emit(AuthEvent::Logout {
            tab_id: user.tab_id.clone(),
            user,
        });
        true
    }

    /// Clear the whole registry, every tab included, and broadcast it.
    pub fn logout_all(&self) {
        self.registry.save_sessions(&std::collections::HashMap::new());
        self.registry.tab_store().remove(WAS_LOGGED_IN_KEY);
        self.roles.clear_role("admin");
        self.roles.clear_role("user");
        self.registry
            .persistent()
            .set(LOGOUT_SYNC_ALL_KEY, &self.registry.now_ms().to_string());
        log::info!("all sessions cleared from {}", self.registry.tab_id());
        self.emit(AuthEvent::LogoutAll);
    }

    /// Remove this tab's entry without re-broadcasting. Used when reacting
    /// to another tab's logout so the notification cannot loop.
    pub fn local_logout(&self) {
        let mut sessions = self.registry.all_sessions();
        if sessions.remove(self.registry.tab_id()).is_some() {
            self.registry.save_sessions(&sessions);
        }
        self.registry.tab_store().remove(WAS_LOGGED_IN_KEY);
    }

    pub fn is_logged_in(&self) -> bool {
        self.registry.current_user().is_some()
    }

    pub fn is_admin(&self) -> bool {
        self.registry
            .current_user()
            .map(|user| user.is_admin())
            .unwrap_or(false)
    }

    /// Named capability check for the checker page, currently any login.
    pub fn can_access_grammar_checker(&self) -> bool {
        self.is_logged_in()
    }

    /// Named capability check for the admin panel, currently the admin role.
    pub fn can_access_admin_panel(&self) -> bool {
        self.is_admin()
    }

    /// Access decision for a page path, without side effects.
    pub fn page_access(&self, path: &str) -> Result<(), DenyReason> {
        match classify_page(path) {
            PageKind::AdminPanel if !self.can_access_admin_panel() => {
                Err(DenyReason::AdminRequired)
            }
            PageKind::GrammarChecker if !self.can_access_grammar_checker() => {
                Err(DenyReason::LoginRequired)
            }
            _ => Ok(()),
        }
    }

    /// One-shot page-load check: on denial, redirect to the login page
    /// with the reason code and return false.
    pub fn validate_page_access(&self, path: &str, navigator: &dyn Navigator) -> bool {
        match self.page_access(path) {
            Ok(()) => true,
            Err(reason) => {
                log::warn!("access to {} denied: {}", path, reason.code());
                navigator.redirect(&reason.login_url());
                false
            }
        }
    }

    /// Record a user-interaction signal; persisted at most once per
    /// throttle window.
    pub fn record_interaction(&self) -> bool {
        self.activity.touch(&self.registry)
    }

    /// Drain pending broadcast notifications and react to them.
    ///
    /// A targeted logout whose userId matches this tab's session, or any
    /// logout-all, forces a local-only logout and a redirect carrying the
    /// `logout_sync` reason. Delivery is at-most-once per write and
    /// last-write-wins: a tab that slept through several writes reacts to
    /// the final value only.
    pub fn process_storage_events(&self, navigator: &dyn Navigator) {
        for event in self.watcher.poll() {
            match event.key.as_str() {
                LOGOUT_SYNC_KEY => self.handle_logout_sync(event.value.as_deref(), navigator),
                LOGOUT_SYNC_ALL_KEY => self.handle_logout_all_sync(navigator),
                _ => {}
            }
        }
    }

    fn handle_logout_sync(&self, raw: Option<&str>, navigator: &dyn Navigator) {
        let Some(raw) = raw else { return };
        let broadcast = match serde_json::from_str::<LogoutSyncEvent>(raw) {
            Ok(broadcast) => broadcast,
            Err(e) => {
                log::debug!("ignoring malformed logout broadcast: {}", e);
                return;
            }
        };
        let Some(user) = self.registry.current_user() else {
            return;
        };
        if user.user_id != broadcast.user_id {
            return;
        }

        log::info!(
            "logout of {} broadcast from {}, leaving",
            broadcast.user_id,
            broadcast.session_id
        );
        self.local_logout();
        self.emit(AuthEvent::LogoutSync {
            user_id: broadcast.user_id,
            tab_id: self.registry.tab_id().to_string(),
        });
        navigator.redirect(&DenyReason::LogoutSync.login_url());
    }

    fn handle_logout_all_sync(&self, navigator: &dyn Navigator) {
        let Some(user) = self.registry.current_user() else {
            return;
        };
        self.local_logout();
        self.emit(AuthEvent::LogoutSync {
            user_id: user.user_id,
            tab_id: self.registry.tab_id().to_string(),
        });
        navigator.redirect(&DenyReason::LogoutSync.login_url());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin_storage::{ADMIN_STORAGE_KEY, USER_STORAGE_KEY};
    use crate::clock::ManualClock;
    use crate::guard::RecordingNavigator;
    use crate::session::SESSIONS_KEY;

    fn manager(profile: &SharedStore, now_ms: i64) -> (AuthManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now_ms));
        let manager = AuthManager::new(
            profile,
            Arc::new(TabStore::new()),
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        (manager, clock)
    }

    #[test]
    fn login_roundtrip_per_role() {
        for role in [UserRole::Admin, UserRole::User] {
            let profile = SharedStore::new();
            let (auth, _) = manager(&profile, 5_000);
            auth.login(&LoginResponse::with_identity("42", "kim", role)).unwrap();

            let current = auth.registry().current_user().unwrap();
            assert_eq!(current.user_id, "42");
            assert_eq!(current.username, "kim");
            assert_eq!(current.user_role, role);
            assert_eq!(current.login_time, 5_000);
            assert_eq!(current.last_active, current.login_time);
            assert!(auth.is_logged_in());
            assert_eq!(auth.is_admin(), role == UserRole::Admin);
        }
    }

    #[test]
    fn login_requires_a_role() {
        let profile = SharedStore::new();
        let (auth, _) = manager(&profile, 5_000);
        let mut response = LoginResponse::with_identity("42", "kim", UserRole::User);
        response.user_role = None;

        let err = auth.login(&response).unwrap_err();
        assert!(matches!(err, AuthError::InvalidInput(_)));
        assert!(!auth.is_logged_in());
    }

    #[test]
    fn normalization_precedence() {
        // Top-level userId wins over both fallbacks
        let response: LoginResponse = serde_json::from_str(
            r#"{"userId": 7, "id": "ignored", "user": {"id": "also-ignored"},
                "username": "ada", "userRole": "admin"}"#,
        )
        .unwrap();
        let record = normalize_login_response(&response).unwrap();
        assert_eq!(record.user_id, "7");

        // Nested user.id wins over bare id
        let response: LoginResponse = serde_json::from_str(
            r#"{"id": "outer", "user": {"id": 99, "username": "ada", "role": "user"},
                "email": "top@example.com"}"#,
        )
        .unwrap();
        let record = normalize_login_response(&response).unwrap();
        assert_eq!(record.user_id, "99");
        assert_eq!(record.username, "ada");
        assert_eq!(record.user_role, UserRole::User);
        assert_eq!(record.email, "top@example.com");

        // Bare id as the last resort, profile fields from the nested user
        let response: LoginResponse = serde_json::from_str(
            r#"{"id": "55", "name": "fallback", "role": "user",
                "user": {"fullName": "Fall Back"}}"#,
        )
        .unwrap();
        let record = normalize_login_response(&response).unwrap();
        assert_eq!(record.user_id, "55");
        assert_eq!(record.username, "fallback");
        assert_eq!(record.full_name, "Fall Back");
    }

    #[test]
    fn unknown_roles_are_rejected() {
        let response: LoginResponse = serde_json::from_str(
            r#"{"userId": "1", "username": "who", "userRole": "superadmin"}"#,
        )
        .unwrap();
        assert!(matches!(
            normalize_login_response(&response),
            Err(AuthError::InvalidInput(_))
        ));
    }

    #[test]
    fn logout_clears_the_session() {
        let profile = SharedStore::new();
        let (auth, _) = manager(&profile, 5_000);
        auth.login(&LoginResponse::with_identity("42", "kim", UserRole::User)).unwrap();
        assert_eq!(auth.registry().tab_store().get(WAS_LOGGED_IN_KEY).as_deref(), Some("1"));

        assert!(auth.logout());
        assert!(auth.registry().current_user().is_none());
        assert!(!auth.is_logged_in());
        assert!(auth.registry().tab_store().get(WAS_LOGGED_IN_KEY).is_none());

        // The broadcast payload names the user and the departing tab
        let raw = profile.get(LOGOUT_SYNC_KEY).unwrap();
        let broadcast: LogoutSyncEvent = serde_json::from_str(&raw).unwrap();
        assert_eq!(broadcast.user_id, "42");
        assert_eq!(broadcast.session_id, auth.registry().tab_id());
    }

    #[test]
    fn logout_without_a_session_is_a_reported_noop() {
        let profile = SharedStore::new();
        profile.set(SESSIONS_KEY, r#"{"tab_other": {"userId": "1", "username": "a", "userRole": "user"}}"#);
        let (auth, _) = manager(&profile, 5_000);

        assert!(!auth.logout());
        // The registry was not rewritten
        assert_eq!(auth.registry().all_sessions().len(), 1);
        assert!(profile.get(LOGOUT_SYNC_KEY).is_none());
    }

    #[test]
    fn cross_tab_logout_removes_the_matching_session() {
        let profile = SharedStore::new();
        let (tab_a, _) = manager(&profile, 5_000);
        let (tab_b, _) = manager(&profile, 5_000);

        // Same account open in two tabs
        tab_a.login(&LoginResponse::with_identity("42", "kim", UserRole::User)).unwrap();
        tab_b.login(&LoginResponse::with_identity("42", "kim", UserRole::User)).unwrap();
        assert_eq!(tab_a.registry().all_sessions().len(), 2);

        assert!(tab_a.logout());

        let navigator = RecordingNavigator::new();
        tab_b.process_storage_events(&navigator);

        assert!(!tab_b.is_logged_in());
        assert!(tab_a.registry().all_sessions().is_empty());
        assert_eq!(navigator.last().as_deref(), Some("/login?message=logout_sync"));
    }

    #[test]
    fn unrelated_logout_broadcasts_are_ignored() {
        let profile = SharedStore::new();
        let (tab_a, _) = manager(&profile, 5_000);
        let (tab_b, _) = manager(&profile, 5_000);

        tab_a.login(&LoginResponse::with_identity("42", "kim", UserRole::User)).unwrap();
        tab_b.login(&LoginResponse::with_identity("77", "lou", UserRole::User)).unwrap();

        tab_a.logout();
        let navigator = RecordingNavigator::new();
        tab_b.process_storage_events(&navigator);

        assert!(tab_b.is_logged_in());
        assert!(navigator.last().is_none());
    }

    #[test]
    fn the_reacting_tab_does_not_rebroadcast() {
        let profile = SharedStore::new();
        let (tab_a, _) = manager(&profile, 5_000);
        let (tab_b, _) = manager(&profile, 5_000);

        tab_a.login(&LoginResponse::with_identity("42", "kim", UserRole::User)).unwrap();
        tab_b.login(&LoginResponse::with_identity("42", "kim", UserRole::User)).unwrap();
        tab_a.logout();

        let before = profile.get(LOGOUT_SYNC_KEY);
        tab_b.process_storage_events(&RecordingNavigator::new());
        // tab_b left quietly; the broadcast key still holds tab_a's write
        assert_eq!(profile.get(LOGOUT_SYNC_KEY), before);

        // And tab_a has nothing pending from tab_b's local logout
        let navigator = RecordingNavigator::new();
        tab_a.process_storage_events(&navigator);
        assert!(navigator.last().is_none());
    }

    #[test]
    fn logout_all_clears_every_tab() {
        let profile = SharedStore::new();
        let (tab_a, _) = manager(&profile, 5_000);
        let (tab_b, _) = manager(&profile, 5_000);

        tab_a.login(&LoginResponse::with_identity("1", "root", UserRole::Admin)).unwrap();
        tab_b.login(&LoginResponse::with_identity("42", "kim", UserRole::User)).unwrap();

        tab_a.logout_all();
        assert!(tab_a.registry().all_sessions().is_empty());
        assert_eq!(profile.get(LOGOUT_SYNC_ALL_KEY).as_deref(), Some("5000"));

        let navigator = RecordingNavigator::new();
        tab_b.process_storage_events(&navigator);
        assert!(!tab_b.is_logged_in());
        assert_eq!(navigator.last().as_deref(), Some("/login?message=logout_sync"));
    }

    #[test]
    fn role_mirror_follows_login_and_logout() {
        let profile = SharedStore::new();
        let (auth, _) = manager(&profile, 5_000);

        auth.login(&LoginResponse::with_identity("1", "root", UserRole::Admin)).unwrap();
        assert!(profile.get(ADMIN_STORAGE_KEY).is_some());
        assert!(profile.get(USER_STORAGE_KEY).is_none());

        auth.logout();
        assert!(profile.get(ADMIN_STORAGE_KEY).is_none());
    }

    #[test]
    fn lifecycle_events_are_emitted() {
        let profile = SharedStore::new();
        let (auth, _) = manager(&profile, 5_000);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        auth.on_event(move |event| {
            let label = match event {
                AuthEvent::Login { .. } => "login",
                AuthEvent::Logout { .. } => "logout",
                AuthEvent::LogoutAll => "logout-all",
                AuthEvent::LogoutSync { .. } => "logout-sync",
            };
            sink.lock().unwrap().push(label);
        });

        auth.login(&LoginResponse::with_identity("42", "kim", UserRole::User)).unwrap();
        auth.logout();
        auth.logout_all();

        assert_eq!(*seen.lock().unwrap(), vec!["login", "logout", "logout-all"]);
    }

    #[test]
    fn capability_checks_and_page_validation() {
        let profile = SharedStore::new();
        let (auth, _) = manager(&profile, 5_000);
        let navigator = RecordingNavigator::new();

        assert!(!auth.can_access_grammar_checker());
        assert!(!auth.validate_page_access("/checker", &navigator));
        assert_eq!(navigator.last().as_deref(), Some("/login?message=login_required"));

        auth.login(&LoginResponse::with_identity("42", "kim", UserRole::User)).unwrap();
        assert!(auth.can_access_grammar_checker());
        assert!(!auth.can_access_admin_panel());
        assert!(auth.validate_page_access("/checker", &navigator));
        assert!(!auth.validate_page_access("/admin", &navigator));
        assert_eq!(navigator.last().as_deref(), Some("/login?message=admin_required"));
        assert!(auth.validate_page_access("/", &navigator));
    }
}

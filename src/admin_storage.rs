use crate::guard::PageKind;
use crate::session::SessionRecord;
use crate::storage::{KeyValueStore, SharedStore};

/// Single-record key for the admin session.
pub const ADMIN_STORAGE_KEY: &str = "loggedInAs_admin";
/// Single-record key for the non-admin session.
pub const USER_STORAGE_KEY: &str = "loggedInAs_user";
/// Deprecated combined key, upgraded lazily by `migrate_legacy_data`.
pub const LEGACY_STORAGE_KEY: &str = "loggedInAs";

/// Binary partition of the raw role string. There is no third bucket:
/// anything that is not exactly "admin" maps to the user key.
pub fn storage_key_for_role(role: &str) -> &'static str {
    if role == "admin" {
        ADMIN_STORAGE_KEY
    } else {
        USER_STORAGE_KEY
    }
}

/// Per-role single-record storage, at most one admin and one user session
/// per profile.
///
/// The multi-tab registry is the source of truth; these keys are a mirror
/// written through the auth coordinator on login and logout, plus the
/// upgrade path from the deprecated combined key. A stale mirror loses to
/// the registry and is overwritten by the next auth mutation.
pub struct RoleStorage {
    store: SharedStore,
}

impl RoleStorage {
    pub fn new(store: SharedStore) -> Self {
        RoleStorage { store }
    }

    /// One-time upgrade from the deprecated combined key.
    ///
    /// If the legacy key holds a record with a role, the payload is copied
    /// verbatim to the role-appropriate key and the legacy key is deleted.
    /// Returns the migrated record, or `None` when there was nothing to do.
    /// Safe to call repeatedly; after the first successful run the legacy
    /// key is gone and every later call is a no-op.
    pub fn migrate_legacy_data(&self) -> Option<SessionRecord> {
        let raw = self.store.get(LEGACY_STORAGE_KEY)?;
        let record = match serde_json::from_str::<SessionRecord>(&raw) {
            Ok(record) if record.is_valid() => record,
            _ => {
                log::warn!("legacy login record is unreadable, leaving it in place");
                return None;
            }
        };
        self.store
            .set(storage_key_for_role(record.user_role.as_str()), &raw);
        self.store.remove(LEGACY_STORAGE_KEY);
        log::info!("migrated legacy login record for {}", record.username);
        Some(record)
    }

    /// The stored record for the given page context.
    ///
    /// Runs the legacy migration first, then prefers the role key matching
    /// the page. On an admin page a record whose role is not admin is
    /// treated as absent even though the raw data exists, so a plain user
    /// session is never silently reused for admin UI state.
    pub fn user_data(&self, page: PageKind) -> Option<SessionRecord> {
        self.migrate_legacy_data();

        let lookup_order = if page == PageKind::AdminPanel {
            [ADMIN_STORAGE_KEY, USER_STORAGE_KEY]
        } else {
            [USER_STORAGE_KEY, ADMIN_STORAGE_KEY]
        };
        let record = lookup_order.iter().find_map(|key| {
            let raw = self.store.get(key)?;
            match serde_json::from_str::<SessionRecord>(&raw) {
                Ok(record) if record.is_valid() => Some(record),
                _ => None,
            }
        })?;

        if page == PageKind::AdminPanel && !record.is_admin() {
            return None;
        }
        Some(record)
    }

    /// Mirror a session record under its role key.
    pub fn set_user_data(&self, record: &SessionRecord) {
        match serde_json::to_string(record) {
            Ok(raw) => self
                .store
                .set(storage_key_for_role(record.user_role.as_str()), &raw),
            Err(e) => log::error!("failed to serialize role-partitioned record: {}", e),
        }
    }

    /// Drop the record stored under the key for `role`.
    pub fn clear_role(&self, role: &str) {
        self.store.remove(storage_key_for_role(role));
    }
}

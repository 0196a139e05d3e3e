use prosecheck::auth::{AuthManager, LoginResponse};
use prosecheck::clock::{Clock, ManualClock};
use prosecheck::session::{SESSION_MAX_AGE_MS, SessionInfo, UserRole};
use prosecheck::storage::{SharedStore, TabStore};
use std::sync::Arc;

// Helper to build a tab-bound auth manager over a shared profile
fn open_tab(profile: &SharedStore, clock: &Arc<ManualClock>) -> AuthManager {
    AuthManager::new(
        profile,
        Arc::new(TabStore::new()),
        Arc::clone(clock) as Arc<dyn Clock>,
    )
}

// Test the full login/lookup/logout cycle for one tab
fn test_login_logout_cycle() {
    println!("\n====== Testing login/logout cycle ======");
    let profile = SharedStore::new();
    let clock = Arc::new(ManualClock::new(50_000));
    let tab = open_tab(&profile, &clock);

    assert!(!tab.is_logged_in());
    assert!(!tab.logout(), "logout with no session must report false");

    let user = tab
        .login(&LoginResponse::with_identity("42", "kim", UserRole::User))
        .expect("login should succeed");
    println!("✓ Logged in as {} on {}", user.username, user.tab_id);

    let current = tab.registry().current_user().expect("session should exist");
    assert_eq!(current.user_id, "42");
    assert_eq!(current.username, "kim");
    assert_eq!(current.user_role, UserRole::User);
    assert_eq!(current.last_active, current.login_time);
    assert!(tab.is_logged_in());
    assert!(!tab.is_admin());
    println!("✓ Current user matches the login response");

    assert!(tab.logout());
    assert!(tab.registry().current_user().is_none());
    assert!(!tab.is_logged_in());
    println!("✓ Logout cleared the session");

    assert!(!tab.logout(), "second logout must be a no-op");
    println!("✓ Double logout reported false");
}

// Test activity updates moving lastActive forward
fn test_activity_updates() {
    println!("\n====== Testing activity updates ======");
    let profile = SharedStore::new();
    let clock = Arc::new(ManualClock::new(50_000));
    let tab = open_tab(&profile, &clock);

    tab.login(&LoginResponse::with_identity("42", "kim", UserRole::User))
        .expect("login should succeed");

    clock.advance(90_000);
    assert!(tab.record_interaction(), "first interaction should persist");
    let current = tab.registry().current_user().unwrap();
    assert_eq!(current.last_active, 140_000);
    println!("✓ Interaction bumped lastActive to {}", current.last_active);

    clock.advance(1_000);
    assert!(!tab.record_interaction(), "throttle should absorb the second ping");
    assert_eq!(tab.registry().current_user().unwrap().last_active, 140_000);
    println!("✓ Throttle absorbed a ping inside the window");
}

// Test age-based eviction keeping the current tab and fresh foreigners
fn test_cleanup_old_sessions() {
    println!("\n====== Testing cleanup_old_sessions ======");
    let profile = SharedStore::new();
    let clock = Arc::new(ManualClock::new(0));

    // An old tab logs in, then a day and change passes
    let old_tab = open_tab(&profile, &clock);
    old_tab
        .login(&LoginResponse::with_identity("7", "old", UserRole::User))
        .expect("login should succeed");

    clock.advance(SESSION_MAX_AGE_MS + 1);

    // A fresh tab logs in now
    let fresh_tab = open_tab(&profile, &clock);
    fresh_tab
        .login(&LoginResponse::with_identity("8", "fresh", UserRole::User))
        .expect("login should succeed");

    assert_eq!(fresh_tab.registry().all_sessions().len(), 2);
    let removed = fresh_tab.registry().cleanup_old_sessions(SESSION_MAX_AGE_MS);
    assert_eq!(removed, 1);
    println!("✓ Evicted {} stale session", removed);

    let sessions = fresh_tab.registry().all_sessions();
    assert!(sessions.contains_key(fresh_tab.registry().tab_id()));
    assert!(!sessions.contains_key(old_tab.registry().tab_id()));
    println!("✓ The fresh tab survived, the stale one is gone");

    // The stale tab would survive its own sweep no matter its age
    let removed = old_tab.registry().cleanup_old_sessions(SESSION_MAX_AGE_MS);
    assert_eq!(removed, 0);
    println!("✓ A tab never evicts itself");
}

// Test the diagnostics projection
fn test_sessions_info() {
    println!("\n====== Testing sessions_info ======");
    let profile = SharedStore::new();
    let clock = Arc::new(ManualClock::new(1_000));
    let tab_a = open_tab(&profile, &clock);
    let tab_b = open_tab(&profile, &clock);

    tab_a
        .login(&LoginResponse::with_identity("1", "root", UserRole::Admin))
        .expect("login should succeed");
    tab_b
        .login(&LoginResponse::with_identity("42", "kim", UserRole::User))
        .expect("login should succeed");

    let infos: Vec<SessionInfo> = tab_a.registry().sessions_info().collect();
    assert_eq!(infos.len(), 2);
    let own: Vec<_> = infos.iter().filter(|info| info.is_current).collect();
    assert_eq!(own.len(), 1);
    assert_eq!(own[0].username, "root");
    println!("✓ Diagnostics list both tabs and mark the current one");
}

fn main() {
    test_login_logout_cycle();
    test_activity_updates();
    test_cleanup_old_sessions();
    test_sessions_info();
    println!("\nAll session tests completed.");
}

#![cfg(not(tarpaulin_include))]

use prosecheck::accounts::AccountStore;
use prosecheck::app::{self, AppState};
use prosecheck::clock::{Clock, SystemClock};
use prosecheck::persist;
use prosecheck::session::{SESSION_MAX_AGE_MS, SessionRegistry};
use prosecheck::storage::{SharedStore, TabStore};
use std::sync::Arc;

/// Main entry point for the web application
///
/// Loads the persisted store snapshot, prepares the account database and
/// the bootstrap admin, starts the stale-session sweeper and runs the
/// server.
///
/// # Environment
/// * `BIND_ADDR` - listen address, default `127.0.0.1:3000`
/// * `STATE_FILE` - store snapshot path, default `database/state.bin.gz`
/// * `ADMIN_PASSWORD` - bootstrap admin password, default `changeme`
///
/// # Returns
/// * `Result<(), Box<dyn std::error::Error>>` - Success or error object
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:3000".to_string());
    let state_file =
        std::env::var("STATE_FILE").unwrap_or_else(|_| "database/state.bin.gz".to_string());

    let profile = SharedStore::new();
    match persist::load_store(&state_file) {
        Ok(snapshot) => profile.restore(snapshot),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("could not load saved state from {}: {}", state_file, e),
    }

    let accounts = AccountStore::new("database");
    accounts.init_database()?;
    let admin_password =
        std::env::var("ADMIN_PASSWORD").unwrap_or_else(|_| "changeme".to_string());
    if let Err(e) = accounts.ensure_admin_account(&admin_password) {
        log::error!("could not provision the bootstrap admin account: {}", e);
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state = Arc::new(AppState::new(
        profile.clone(),
        accounts,
        Arc::clone(&clock),
        &state_file,
    ));

    // Hourly sweep of stale sessions, run from a dedicated context that
    // owns no session of its own.
    {
        let profile = profile.clone();
        let clock = Arc::clone(&clock);
        tokio::spawn(async move {
            let sweeper = SessionRegistry::new(&profile, Arc::new(TabStore::new()), clock);
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
            loop {
                interval.tick().await;
                sweeper.cleanup_old_sessions(SESSION_MAX_AGE_MS);
            }
        });
    }

    app::run(state, &bind_addr).await
}

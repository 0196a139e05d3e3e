/*!
# Prosecheck

A grammar-checking web application with multi-tab session management,
built in Rust.

## Overview

Prosecheck pairs a small axum front end (login, signup, checker page,
admin panel) with a session/auth coordination core modeled on the
multi-tab behavior of a shared browser profile: every tab owns exactly
one entry in a shared session registry, logouts are broadcast so sibling
tabs of the same user follow along, and an access guard keeps
unauthorized visitors off protected pages. Grammar checking itself is
delegated to an external service; the bundled endpoint only echoes a
simple request/response back to the client.

## Architecture

### Session Core
- **Technologies**: Rust, serde
- **Key Components**:
  - Key-Value Persistence Adapter - persistent shared scope and ephemeral
    per-tab scope behind one get/set/remove contract, with change
    notifications for cross-tab coordination
  - Session Registry - tab-id keyed session records serialized under a
    single persistent key, with age-based eviction
  - Auth Coordinator - login/logout/logout-all, capability checks,
    lifecycle events, cross-tab logout synchronization
  - Role-Partitioned Storage - per-role single-record keys with a lazy
    upgrade path from the deprecated combined key
  - Access Guard - page classification and notify-then-redirect handling

### Web Layer (feature `web`)
- **Technologies**: axum, tower-http, tokio
- **Core Components**:
  - Account database - argon2-hashed credentials in `database/users.json`
  - Router and guard middleware - cookie-identified tabs, redirects with
    reason codes (`admin_required`, `login_required`, `logout_sync`)
  - Diagnostics - per-session info for the admin panel

### Data Persistence Layer
- Store snapshots with Gzip compression and bincode serialization
- JSON user database

## Modules

- **storage**: key-value scopes and change notifications
- **clock**: pluggable epoch-millisecond time source
- **session**: session records and the shared registry
- **auth**: the per-tab auth coordinator
- **admin_storage**: role-partitioned keys and legacy migration
- **guard**: page classification and the access guard
- **timers**: deadline timer queue (activity ping, auto refresh,
  delayed redirects)
- **persist**: store snapshot persistence
- **accounts**: user database (web)
- **app**: routing and middleware (web)
*/

// Re-export all modules so they appear in the documentation
pub mod accounts;
pub mod admin_storage;
pub mod app;
pub mod auth;
pub mod clock;
pub mod guard;
pub mod persist;
pub mod session;
pub mod storage;
pub mod timers;

/// Re-export everything from these modules to make it easier to use
pub use admin_storage::*;
pub use auth::*;
pub use clock::*;
pub use guard::*;
pub use persist::*;
pub use session::*;
pub use storage::*;
pub use timers::*;

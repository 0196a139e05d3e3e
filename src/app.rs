#![cfg(not(tarpaulin_include))]
#![cfg(feature = "web")]

use axum::{
    Form, Json, Router,
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use crate::accounts::{AccountStore, Credentials};
use crate::auth::AuthManager;
use crate::clock::Clock;
use crate::guard::RecordingNavigator;
use crate::persist;
use crate::session::{SessionInfo, TAB_ID_KEY};
use crate::storage::{KeyValueStore, SharedStore, TabStore};

/// Cookie carrying the client's tab identity. Each browser context that
/// presents a distinct value gets its own auth manager, which is how the
/// multi-tab session model maps onto HTTP.
const TAB_COOKIE: &str = "tab";

pub struct AppState {
    profile: SharedStore,
    tabs: Mutex<HashMap<String, Arc<AuthManager>>>,
    accounts: AccountStore,
    clock: Arc<dyn Clock>,
    state_file: String,
}

impl AppState {
    pub fn new(
        profile: SharedStore,
        accounts: AccountStore,
        clock: Arc<dyn Clock>,
        state_file: &str,
    ) -> Self {
        AppState {
            profile,
            tabs: Mutex::new(HashMap::new()),
            accounts,
            clock,
            state_file: state_file.to_string(),
        }
    }

    pub fn profile(&self) -> &SharedStore {
        &self.profile
    }

    /// The auth manager bound to one tab cookie, created on first sight.
    ///
    /// An unknown cookie value (for example after a server restart) seeds a
    /// fresh tab store with the presented id, so the tab keeps its identity
    /// and its registry entry.
    pub fn manager_for(&self, tab_cookie: Option<&str>) -> (String, Arc<AuthManager>) {
        let mut tabs = self.tabs.lock().unwrap();
        if let Some(id) = tab_cookie {
            if let Some(manager) = tabs.get(id) {
                return (id.to_string(), Arc::clone(manager));
            }
        }

        let tab = Arc::new(TabStore::new());
        if let Some(id) = tab_cookie {
            tab.set(TAB_ID_KEY, id);
        }
        let manager = Arc::new(AuthManager::new(&self.profile, tab, Arc::clone(&self.clock)));
        let tab_id = manager.registry().tab_id().to_string();
        tabs.insert(tab_id.clone(), Arc::clone(&manager));
        (tab_id, manager)
    }

    /// Write the shared store to the state file.
    pub fn snapshot_state(&self) {
        if let Err(e) = persist::save_store(&self.profile, &self.state_file) {
            log::error!("failed to save state to {}: {}", self.state_file, e);
        }
    }
}

pub async fn run(state: Arc<AppState>, bind_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    // Routes behind the access guard
    let guarded = Router::new()
        .route("/checker", get(serve_checker))
        .route("/admin", get(serve_admin))
        .route("/api/check", post(handle_check))
        .route("/api/sessions", get(list_sessions))
        .route("/api/logout-all", post(handle_logout_all))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_auth,
        ));

    // Build router
    let app = Router::new()
        .route("/", get(serve_landing))
        .route("/login", get(serve_login_page).post(handle_login))
        .route("/signup", get(serve_signup_page).post(handle_signup))
        .route("/logout", get(handle_logout))
        .merge(guarded)
        .nest_service("/static", ServeDir::new("static"))
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
        .with_state(state);

    // Start server
    let listener = TcpListener::bind(bind_addr).await?;
    println!("Listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn serve_landing() -> Html<&'static str> {
    Html(include_str!("./static/landing.html"))
}

async fn serve_login_page() -> Html<&'static str> {
    Html(include_str!("./static/login.html"))
}

async fn serve_signup_page() -> Html<&'static str> {
    Html(include_str!("./static/signup.html"))
}

async fn serve_checker() -> Html<&'static str> {
    Html(include_str!("./static/checker.html"))
}

async fn serve_admin() -> Html<&'static str> {
    Html(include_str!("./static/admin.html"))
}

/// Authentication middleware
///
/// Resolves the requesting tab, lets it react to pending logout
/// broadcasts, then checks the page capability for the request path.
/// Denials redirect to the login page with a reason code and the original
/// path in `next`.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let (_tab_id, manager) = state.manager_for(jar.get(TAB_COOKIE).map(|c| c.value()));

    // 1) another tab may have logged this user out since the last request
    let navigator = RecordingNavigator::new();
    manager.process_storage_events(&navigator);
    if let Some(url) = navigator.last() {
        state.snapshot_state();
        return Redirect::to(&url).into_response();
    }

    // 2) capability check for the path
    match manager.page_access(&path) {
        Ok(()) => {
            // 3) count the request as user activity (throttled)
            manager.record_interaction();
            next.run(request).await
        }
        Err(reason) => {
            let target = format!("{}&next={}", reason.login_url(), urlencoding::encode(&path));
            Redirect::to(&target).into_response()
        }
    }
}

/// Handle user login requests
///
/// Verifies credentials against the account database, establishes the
/// session for the requesting tab and sets the tab cookie.
pub async fn handle_login(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Form(credentials): Form<Credentials>,
) -> Response {
    match state.accounts.verify_user(&credentials.username, &credentials.password) {
        Ok(Some(account)) => {
            let (tab_id, manager) = state.manager_for(jar.get(TAB_COOKIE).map(|c| c.value()));
            match manager.login(&account.to_login_response()) {
                Ok(user) => {
                    state.snapshot_state();
                    let mut cookie = Cookie::new(TAB_COOKIE, tab_id);
                    cookie.set_path("/");
                    let target = if user.is_admin() { "/admin" } else { "/checker" };
                    (jar.add(cookie), Redirect::to(target)).into_response()
                }
                Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
            }
        }
        Ok(None) => (StatusCode::UNAUTHORIZED, "Invalid username or password").into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Authentication error").into_response(),
    }
}

/// Handle user registration
pub async fn handle_signup(
    State(state): State<Arc<AppState>>,
    Form(credentials): Form<Credentials>,
) -> Result<Redirect, (StatusCode, String)> {
    match state.accounts.register_user(&credentials) {
        Ok(_) => Ok(Redirect::to("/login?registered=true")),
        Err(e) => Err((StatusCode::BAD_REQUEST, e)),
    }
}

/// Handle user logout
///
/// Ends the requesting tab's session; sibling tabs of the same user pick
/// the broadcast up on their next request.
pub async fn handle_logout(State(state): State<Arc<AppState>>, jar: CookieJar) -> Redirect {
    let (_, manager) = state.manager_for(jar.get(TAB_COOKIE).map(|c| c.value()));
    if manager.logout() {
        state.snapshot_state();
    }
    Redirect::to("/login")
}

/// Session diagnostics for the admin panel.
pub async fn list_sessions(State(state): State<Arc<AppState>>, jar: CookieJar) -> Response {
    let (_, manager) = state.manager_for(jar.get(TAB_COOKIE).map(|c| c.value()));
    if !manager.can_access_admin_panel() {
        return (StatusCode::FORBIDDEN, "Admin access required").into_response();
    }

    let infos: Vec<SessionInfo> = manager.registry().sessions_info().collect();
    Json(infos).into_response()
}

/// Clear every session in the registry (admin only).
pub async fn handle_logout_all(State(state): State<Arc<AppState>>, jar: CookieJar) -> Response {
    let (_, manager) = state.manager_for(jar.get(TAB_COOKIE).map(|c| c.value()));
    if !manager.can_access_admin_panel() {
        return (StatusCode::FORBIDDEN, "Admin access required").into_response();
    }

    manager.logout_all();
    state.snapshot_state();
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

#[derive(Deserialize)]
pub struct CheckRequest {
    pub text: String,
}

#[derive(Serialize)]
pub struct CheckResponse {
    pub words: usize,
    pub characters: usize,
    pub text: String,
    pub suggestions: Vec<String>,
    pub checked_at: i64,
}

/// Grammar check endpoint.
///
/// The checking engine itself is an external service; this endpoint only
/// echoes the submitted text back in the envelope the page expects.
pub async fn handle_check(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CheckRequest>,
) -> impl IntoResponse {
    Json(CheckResponse {
        words: payload.text.split_whitespace().count(),
        characters: payload.text.chars().count(),
        suggestions: Vec::new(),
        checked_at: state.clock.now_ms(),
        text: payload.text,
    })
}

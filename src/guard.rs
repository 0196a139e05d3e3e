use crate::auth::AuthManager;
use crate::timers::TimerQueue;
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::{Arc, Mutex};

/// Delay between the denial notification and the redirect, so the
/// notification has time to render. The scheduled redirect is not
/// cancellable.
pub const REDIRECT_DELAY_MS: i64 = 3000;

lazy_static! {
    static ref ADMIN_PAGE_RE: Regex = Regex::new(r"(?i)(^|/)admin([/._-]|$)").unwrap();
    static ref CHECKER_PAGE_RE: Regex = Regex::new(r"(?i)(^|/)(grammar|check(er)?)([/._-]|$)").unwrap();
}

/// What a request path designates, for access control purposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageKind {
    AdminPanel,
    GrammarChecker,
    Public,
}

/// Classify a path. Admin pages win over checker pages; anything else is
/// public. Query strings are ignored.
pub fn classify_page(path: &str) -> PageKind {
    let path = path.split('?').next().unwrap_or(path);
    if ADMIN_PAGE_RE.is_match(path) {
        PageKind::AdminPanel
    } else if CHECKER_PAGE_RE.is_match(path) {
        PageKind::GrammarChecker
    } else {
        PageKind::Public
    }
}

/// Why access was denied, surfaced to the login page as a query code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DenyReason {
    AdminRequired,
    LoginRequired,
    LogoutSync,
}

impl DenyReason {
    pub fn code(&self) -> &'static str {
        match self {
            DenyReason::AdminRequired => "admin_required",
            DenyReason::LoginRequired => "login_required",
            DenyReason::LogoutSync => "logout_sync",
        }
    }

    pub fn login_url(&self) -> String {
        format!("/login?message={}", self.code())
    }

    pub fn message(&self) -> &'static str {
        match self {
            DenyReason::AdminRequired => "Admin access is required for this page",
            DenyReason::LoginRequired => "Please log in to continue",
            DenyReason::LogoutSync => "You have been logged out in another tab",
        }
    }
}

/// Redirect sink. The application points this at the browser/location
/// equivalent; tests record the URLs instead.
pub trait Navigator: Send + Sync {
    fn redirect(&self, url: &str);
}

/// Transient notification sink.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str);
}

/// Navigator that records every redirect, for tests and scenario binaries.
#[derive(Default)]
pub struct RecordingNavigator {
    redirects: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    pub fn new() -> Self {
        RecordingNavigator::default()
    }

    pub fn last(&self) -> Option<String> {
        self.redirects.lock().unwrap().last().cloned()
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.redirects.lock().unwrap())
    }
}

impl Navigator for RecordingNavigator {
    fn redirect(&self, url: &str) {
        self.redirects.lock().unwrap().push(url.to_string());
    }
}

/// Notifier that just logs the message.
#[derive(Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) {
        log::info!("notification: {}", message);
    }
}

/// Page-load access check: notify on denial, then redirect after a fixed
/// delay. Evaluated once per load, not a continuous enforcement loop.
pub struct AccessGuard {
    navigator: Arc<dyn Navigator>,
    notifier: Arc<dyn Notifier>,
}

impl AccessGuard {
    pub fn new(navigator: Arc<dyn Navigator>, notifier: Arc<dyn Notifier>) -> Self {
        AccessGuard { navigator, notifier }
    }

    /// Returns true when the current session may stay on `path`. On denial
    /// the notification is shown immediately and the redirect is scheduled
    /// `REDIRECT_DELAY_MS` out on `timers`.
    pub fn check_on_load(&self, auth: &AuthManager, path: &str, timers: &TimerQueue) -> bool {
        match auth.page_access(path) {
            Ok(()) => true,
            Err(reason) => {
                self.notifier.notify(reason.message());
                log::warn!("access to {} denied: {}", path, reason.code());
                let navigator = Arc::clone(&self.navigator);
                let url = reason.login_url();
                timers.schedule_once(REDIRECT_DELAY_MS, move || navigator.redirect(&url));
                false
            }
        }
    }
}

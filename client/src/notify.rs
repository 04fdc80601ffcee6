use std::fmt;

/// User-facing outcome of a session operation. Rendering is up to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    /// A login attempt was refused; the user stays on the form.
    LoginRejected,
    /// Tokens passed to `login` were not usable strings.
    InvalidTokenFormat,
    /// Stored tokens stopped validating, or a request came back 401.
    SessionExpired,
    /// The remote service could not be reached.
    Connectivity,
    /// Tokens were accepted but could not be written to durable storage.
    StorageUnavailable,
    LoggedOut,
    LogoutFailed,
}

impl Notice {
    pub fn is_error(self) -> bool {
        !matches!(self, Notice::LoggedOut)
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Notice::LoginRejected => "Login failed: the credentials were not accepted",
            Notice::InvalidTokenFormat => "Login failed: invalid token format",
            Notice::SessionExpired => "Your session has expired, please sign in again",
            Notice::Connectivity => "Connection error, please try again",
            Notice::StorageUnavailable => "Could not save the session on this device",
            Notice::LoggedOut => "You have signed out",
            Notice::LogoutFailed => "Signed out locally; the server did not confirm",
        };
        f.write_str(text)
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Route changes requested by the session layer (after logout, on expiry).
pub trait Navigator: Send + Sync {
    fn navigate(&self, route: &str);
}

/// Sends notices to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notice: Notice) {
        if notice.is_error() {
            tracing::warn!(?notice, "{}", notice);
        } else {
            tracing::info!(?notice, "{}", notice);
        }
    }
}

/// Records the requested route in the log; for consumers without a router.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNavigator;

impl Navigator for TracingNavigator {
    fn navigate(&self, route: &str) {
        tracing::info!(route, "navigation requested");
    }
}

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_REGISTRATION_URL: &str = "https://registration-fastapi.onrender.com";
pub const DEFAULT_PERSONAL_ACCOUNT_URL: &str = "https://personal-account-fastapi.onrender.com";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Where the session layer talks to and where it sends the user afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the registration service (token validation, OAuth, credentials).
    pub registration_url: String,
    /// Base URL of the personal-account service (logout).
    pub personal_account_url: String,
    /// Public route shown after logout.
    pub landing_route: String,
    /// Route shown when a session expires.
    pub login_route: String,
    /// Route shown after a successful sign-in.
    pub home_route: String,
    #[serde(with = "timeout_secs")]
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            registration_url: DEFAULT_REGISTRATION_URL.to_string(),
            personal_account_url: DEFAULT_PERSONAL_ACCOUNT_URL.to_string(),
            landing_route: "/".to_string(),
            login_route: "/login".to_string(),
            home_route: "/profile".to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl ClientConfig {
    /// Point both remote services at the same base URL. Used by tests and local stacks.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let base = trim_base_url(&base_url.into());
        Self {
            registration_url: base.clone(),
            personal_account_url: base,
            ..Self::default()
        }
    }

    pub fn with_registration_url(mut self, url: impl Into<String>) -> Self {
        self.registration_url = trim_base_url(&url.into());
        self
    }

    pub fn with_personal_account_url(mut self, url: impl Into<String>) -> Self {
        self.personal_account_url = trim_base_url(&url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Reads `PORTAL_*` variables from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let timeout = get("PORTAL_HTTP_TIMEOUT_SECS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeout);

        Self {
            registration_url: get("PORTAL_REGISTRATION_URL")
                .map(|v| trim_base_url(&v))
                .unwrap_or(defaults.registration_url),
            personal_account_url: get("PORTAL_PERSONAL_ACCOUNT_URL")
                .map(|v| trim_base_url(&v))
                .unwrap_or(defaults.personal_account_url),
            landing_route: get("PORTAL_LANDING_ROUTE").unwrap_or(defaults.landing_route),
            login_route: get("PORTAL_LOGIN_ROUTE").unwrap_or(defaults.login_route),
            home_route: get("PORTAL_HOME_ROUTE").unwrap_or(defaults.home_route),
            timeout,
        }
    }
}

fn trim_base_url(value: &str) -> String {
    value.trim().trim_end_matches('/').to_string()
}

mod timeout_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

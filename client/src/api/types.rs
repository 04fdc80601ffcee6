use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::SessionError;

/// Identifier the identity service reports for a user. Arrives as a string or a number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Signed(i64),
            Unsigned(u64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => UserId(s),
            Raw::Signed(n) => UserId(n.to_string()),
            Raw::Unsigned(n) => UserId(n.to_string()),
        })
    }
}

/// Body of `GET /validate/jwt/user/{access}/{refresh}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidationResponse {
    pub result: bool,
    #[serde(default)]
    pub user_id: Option<UserId>,
}

impl ValidationResponse {
    /// The user id of an accepted pair; `Rejected` for `result: false` or a missing id.
    pub fn accepted_user(self) -> Result<UserId, SessionError> {
        match self.user_id {
            Some(id) if self.result && !id.is_empty() => Ok(id),
            _ => Err(SessionError::Rejected),
        }
    }
}

/// Access/refresh pair issued by the registration service.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access", &mask_token(&self.access))
            .field("refresh", &mask_token(&self.refresh))
            .finish()
    }
}

impl TokenPair {
    /// Builds a pair, rejecting tokens that cannot be sent as a path segment or header.
    pub fn new(access: &str, refresh: &str) -> Result<Self, SessionError> {
        if !is_well_formed(access) || !is_well_formed(refresh) {
            return Err(SessionError::InvalidTokenFormat);
        }
        Ok(Self {
            access: access.to_string(),
            refresh: refresh.to_string(),
        })
    }

    /// Builds a pair from loosely typed JSON; anything other than two strings is rejected.
    pub fn from_values(access: &Value, refresh: &Value) -> Result<Self, SessionError> {
        match (access, refresh) {
            (Value::String(a), Value::String(r)) => Self::new(a, r),
            _ => Err(SessionError::InvalidTokenFormat),
        }
    }
}

fn is_well_formed(token: &str) -> bool {
    !token.trim().is_empty() && !token.chars().any(|c| c.is_control() || c.is_whitespace())
}

/// First four characters and the length. Tokens never reach the logs verbatim.
pub fn mask_token(token: &str) -> String {
    if token.is_empty() {
        return "<empty>".into();
    }
    let prefix = token.chars().take(4).collect::<String>();
    format!("{}*** (len={})", prefix, token.len())
}

/// Error body returned by the registration service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiMessage {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub detail: Option<Value>,
}

impl ApiMessage {
    pub fn text(&self) -> Option<String> {
        self.message.clone().or_else(|| match &self.detail {
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
            None => None,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EmailLoginRequest {
    pub email: String,
    pub hash_password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub first_name: String,
    pub last_name: String,
    pub phone_number: String,
    pub email: String,
    pub hash_password: String,
}

/// Body of a provider code exchange.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderTokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
}

/// Tokens issued by a login or registration call. Kept loose so that
/// `SessionManager::login_values` decides whether they are usable.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IssuedTokens {
    #[serde(default)]
    pub access: Value,
    #[serde(default)]
    pub refresh: Value,
}

impl IssuedTokens {
    pub fn is_empty(&self) -> bool {
        self.access.is_null() && self.refresh.is_null()
    }
}

/// Identity providers reachable through the registration service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Vk,
    Yandex,
    MailRu,
}

impl Provider {
    /// Path segment the registration service uses for this provider.
    pub fn path(self) -> &'static str {
        match self {
            Provider::Vk => "vk",
            Provider::Yandex => "yandex",
            Provider::MailRu => "mail.ru",
        }
    }

    pub fn verifier_key(self) -> String {
        format!("{}_code_verifier", self.storage_prefix())
    }

    pub fn state_key(self) -> String {
        format!("{}_oauth_state", self.storage_prefix())
    }

    fn storage_prefix(self) -> &'static str {
        match self {
            Provider::Vk => "vk",
            Provider::Yandex => "yandex",
            Provider::MailRu => "mailru",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vk" | "vkontakte" => Ok(Provider::Vk),
            "yandex" => Ok(Provider::Yandex),
            "mail.ru" | "mailru" | "mail" => Ok(Provider::MailRu),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

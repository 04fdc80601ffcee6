use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::Instrument;

use crate::{api::types::*, config::ClientConfig, error::SessionError};

pub const ACCESS_TOKEN_HEADER: &str = "x-access-token";
pub const REFRESH_TOKEN_HEADER: &str = "x-refresh-token";

/// Characters left unescaped in a URL path segment (RFC 3986 unreserved).
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub(crate) fn encode_segment(segment: &str) -> String {
    utf8_percent_encode(segment, PATH_SEGMENT).to_string()
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Json(Value),
    Text(String),
}

/// Method, extra headers and body of a call made through `fetch_with_auth`.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<RequestBody>,
}

impl RequestOptions {
    pub fn get() -> Self {
        Self::default()
    }

    pub fn post() -> Self {
        Self::default().method(Method::POST)
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }

    pub fn text(mut self, body: impl Into<String>) -> Self {
        self.body = Some(RequestBody::Text(body.into()));
        self
    }
}

/// HTTP access to the registration and personal-account services.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    config: ClientConfig,
}

impl Default for ApiClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl ApiClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            client: build_http_client(&config),
            config,
        }
    }

    pub fn new_with_base_url(base_url: impl Into<String>) -> Self {
        Self::new(ClientConfig::with_base_url(base_url))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn http_client(&self) -> &Client {
        &self.client
    }

    pub(crate) fn registration_url(&self, path: &str) -> String {
        format!("{}{}", self.config.registration_url, path)
    }

    pub fn validation_url(&self, tokens: &TokenPair) -> String {
        self.registration_url(&format!(
            "/validate/jwt/user/{}/{}",
            encode_segment(&tokens.access),
            encode_segment(&tokens.refresh)
        ))
    }

    pub fn logout_url(&self) -> String {
        format!("{}/logout/", self.config.personal_account_url)
    }

    /// Custom token headers; the bearer scheme is not used by these services.
    pub fn auth_headers(tokens: &TokenPair) -> Result<HeaderMap, SessionError> {
        let mut headers = HeaderMap::new();
        let access =
            HeaderValue::from_str(&tokens.access).map_err(|_| SessionError::InvalidTokenFormat)?;
        let refresh =
            HeaderValue::from_str(&tokens.refresh).map_err(|_| SessionError::InvalidTokenFormat)?;
        headers.insert(HeaderName::from_static(ACCESS_TOKEN_HEADER), access);
        headers.insert(HeaderName::from_static(REFRESH_TOKEN_HEADER), refresh);
        Ok(headers)
    }

    /// Asks the identity service whether `tokens` is a live pair and for whom.
    pub async fn validate_tokens(&self, tokens: &TokenPair) -> Result<UserId, SessionError> {
        let url = self.validation_url(tokens);
        let span = tracing::debug_span!("validate_tokens", access = %mask_token(&tokens.access));

        async move {
            let response = self.client.get(&url).send().await?;
            let status = response.status();
            if !status.is_success() {
                tracing::debug!(%status, "validation endpoint refused the request");
                return Err(SessionError::Status(status));
            }
            let body: ValidationResponse = read_json(response).await?;
            body.accepted_user()
        }
        .instrument(span)
        .await
    }

    /// Sends a request carrying the session headers. Never inspects the status.
    pub async fn send_authenticated(
        &self,
        url: &str,
        options: RequestOptions,
        tokens: Option<&TokenPair>,
    ) -> Result<Response, SessionError> {
        let RequestOptions {
            method,
            mut headers,
            body,
        } = options;
        if let Some(tokens) = tokens {
            headers.extend(Self::auth_headers(tokens)?);
        }

        let mut request = self.client.request(method, url).headers(headers);
        request = match body {
            Some(RequestBody::Json(value)) => request.json(&value),
            Some(RequestBody::Text(text)) => request
                .header(CONTENT_TYPE, "text/plain; charset=utf-8")
                .body(text),
            None => request,
        };
        Ok(request.send().await?)
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn build_http_client(config: &ClientConfig) -> Client {
    Client::builder()
        .timeout(config.timeout)
        .build()
        .unwrap_or_else(|err| {
            tracing::warn!(error = %err, "falling back to default http client");
            Client::new()
        })
}

#[cfg(target_arch = "wasm32")]
fn build_http_client(_config: &ClientConfig) -> Client {
    Client::new()
}

/// Reads the whole body and decodes it, keeping transport and schema failures apart.
pub(crate) async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, SessionError> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| SessionError::Decode(e.to_string()))
}

/// Best-effort human message from an error response.
pub(crate) async fn error_message(response: Response) -> Option<String> {
    let bytes = response.bytes().await.ok()?;
    if let Ok(message) = serde_json::from_slice::<ApiMessage>(&bytes) {
        if let Some(text) = message.text() {
            return Some(text);
        }
    }
    let text = String::from_utf8_lossy(&bytes).trim().to_string();
    (!text.is_empty()).then_some(text)
}

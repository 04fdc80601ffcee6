//! Sign-in through an external identity provider.
//!
//! `begin` produces the authorize URL and remembers the PKCE verifier;
//! `complete` runs the callback as an explicit sequence of steps:
//!
//! ```text
//! Exchange --ok--> Login --ok--------------------> Establish --ok--> done
//!                        \--refused--> Register --ok--/
//! ```
//!
//! Every step has exactly one failure exit, reported as [`OAuthFailure`].

use std::fmt;
use std::sync::Arc;

use url::Url;

use super::pkce;
use crate::{
    api::{IssuedTokens, Provider, UserId},
    error::FlowError,
    state::session::SessionManager,
    utils::storage::ensure_device_id,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthStep {
    Exchange,
    Login,
    Register,
    Establish,
}

impl fmt::Display for OAuthStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OAuthStep::Exchange => "code exchange",
            OAuthStep::Login => "provider login",
            OAuthStep::Register => "provider registration",
            OAuthStep::Establish => "session setup",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{provider} sign-in failed during {step}: {error}")]
pub struct OAuthFailure {
    pub provider: Provider,
    pub step: OAuthStep,
    #[source]
    pub error: FlowError,
}

/// Where to send the user, plus what must be checked on the way back.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub provider: Provider,
    pub url: String,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthSuccess {
    pub user_id: UserId,
    /// The provider account was unknown and has just been registered.
    pub registered: bool,
    pub redirect_to: String,
}

enum Stage {
    Exchange,
    Login { provider_token: String },
    Register { provider_token: String },
    Establish { tokens: IssuedTokens, registered: bool },
}

pub struct OAuthFlow {
    session: Arc<SessionManager>,
}

impl OAuthFlow {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }

    /// Fetches the provider's authorize URL and attaches PKCE and `state`.
    pub async fn begin(&self, provider: Provider) -> Result<AuthorizationRequest, FlowError> {
        let link = self.session.api().oauth_link(provider).await?;
        let mut url = Url::parse(&link).map_err(|e| FlowError::Decode(e.to_string()))?;

        let verifier = pkce::generate_code_verifier();
        let state = pkce::generate_state();
        url.query_pairs_mut()
            .append_pair("code_challenge", &pkce::generate_code_challenge(&verifier))
            .append_pair("code_challenge_method", "S256")
            .append_pair("state", &state);

        let store = self.session.store();
        store.set_item(&provider.verifier_key(), &verifier)?;
        store.set_item(&provider.state_key(), &state)?;

        tracing::info!(%provider, "authorization started");
        Ok(AuthorizationRequest {
            provider,
            url: url.into(),
            state,
        })
    }

    /// Handles the provider callback and, on success, leaves the session authenticated.
    pub async fn complete(
        &self,
        provider: Provider,
        code: &str,
        state: Option<&str>,
    ) -> Result<OAuthSuccess, OAuthFailure> {
        let fail = move |step: OAuthStep| {
            move |error: FlowError| OAuthFailure {
                provider,
                step,
                error,
            }
        };

        let verifier = self
            .take_pending(provider, state)
            .map_err(fail(OAuthStep::Exchange))?;
        let code = code.trim();
        if code.is_empty() {
            return Err(fail(OAuthStep::Exchange)(FlowError::MissingCode));
        }

        let api = self.session.api();
        let mut stage = Stage::Exchange;
        loop {
            stage = match stage {
                Stage::Exchange => {
                    let device_id = ensure_device_id(self.session.store().as_ref())
                        .map_err(|e| fail(OAuthStep::Exchange)(e.into()))?;
                    let provider_token = api
                        .exchange_code(provider, code, &device_id, &verifier)
                        .await
                        .map_err(fail(OAuthStep::Exchange))?;
                    Stage::Login { provider_token }
                }
                Stage::Login { provider_token } => {
                    match api.provider_login(provider, &provider_token).await {
                        Ok(tokens) => Stage::Establish {
                            tokens,
                            registered: false,
                        },
                        Err(FlowError::Rejected { status, .. }) => {
                            tracing::info!(
                                %provider,
                                %status,
                                "provider login refused, registering"
                            );
                            Stage::Register { provider_token }
                        }
                        Err(err) => return Err(fail(OAuthStep::Login)(err)),
                    }
                }
                Stage::Register { provider_token } => {
                    let tokens = api
                        .provider_register(provider, &provider_token)
                        .await
                        .map_err(fail(OAuthStep::Register))?;
                    Stage::Establish {
                        tokens,
                        registered: true,
                    }
                }
                Stage::Establish { tokens, registered } => {
                    if !self
                        .session
                        .login_values(&tokens.access, &tokens.refresh)
                        .await
                    {
                        return Err(fail(OAuthStep::Establish)(FlowError::SessionRefused));
                    }
                    let user_id = self
                        .session
                        .user()
                        .map(|u| u.id)
                        .ok_or_else(|| fail(OAuthStep::Establish)(FlowError::SessionRefused))?;
                    tracing::info!(%provider, %user_id, registered, "signed in with provider");
                    return Ok(OAuthSuccess {
                        user_id,
                        registered,
                        redirect_to: api.config().home_route.clone(),
                    });
                }
            };
        }
    }

    /// Removes the stored verifier and state (single use) and checks `state`.
    fn take_pending(&self, provider: Provider, state: Option<&str>) -> Result<String, FlowError> {
        let store = self.session.store();
        let verifier = store.get_item(&provider.verifier_key())?;
        let expected_state = store.get_item(&provider.state_key())?;
        store.remove_item(&provider.verifier_key())?;
        store.remove_item(&provider.state_key())?;

        let verifier = verifier
            .filter(|v| !v.is_empty())
            .ok_or(FlowError::MissingVerifier(provider))?;
        if let Some(expected) = expected_state {
            if state != Some(expected.as_str()) {
                return Err(FlowError::StateMismatch);
            }
        }
        Ok(verifier)
    }
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod host_tests {
    use super::*;
    use crate::notify::Notice;
    use crate::test_support::Harness;
    use crate::utils::storage::{KeyValueStore, DEVICE_ID_KEY};
    use httpmock::prelude::*;
    use serde_json::json;

    fn pending(h: &Harness, provider: Provider, verifier: &str, state: &str) {
        h.store.set_item(&provider.verifier_key(), verifier).unwrap();
        h.store.set_item(&provider.state_key(), state).unwrap();
    }

    async fn mock_exchange<'a>(
        server: &'a MockServer,
        provider: Provider,
        code: &str,
    ) -> httpmock::Mock<'a> {
        let path = format!("/{}/v1/get/token/{}", provider.path(), code);
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path(path)
                    .query_param("code_verifier", "verifier-1")
                    .query_param_exists("device_id");
                then.status(200).json_body(json!({ "access_token": "prov-tok" }));
            })
            .await
    }

    async fn mock_validation<'a>(server: &'a MockServer, user_id: &str) -> httpmock::Mock<'a> {
        let body = json!({ "result": true, "user_id": user_id });
        server
            .mock_async(|when, then| {
                when.method(GET).path("/validate/jwt/user/acc-9/ref-9");
                then.status(200).json_body(body);
            })
            .await
    }

    #[tokio::test]
    async fn begin_attaches_pkce_and_remembers_verifier() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/vk/v1/link");
                then.status(200)
                    .json_body(json!("https://id.example.com/authorize?client_id=7"));
            })
            .await;
        let h = Harness::new(&server.base_url());
        let flow = OAuthFlow::new(h.session.clone());

        let request = flow.begin(Provider::Vk).await.unwrap();

        let url = Url::parse(&request.url).unwrap();
        let query: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        let verifier = h.store.get_item("vk_code_verifier").unwrap().unwrap();
        assert_eq!(verifier.len(), 64);
        assert_eq!(query["client_id"], "7");
        assert_eq!(query["code_challenge_method"], "S256");
        assert_eq!(query["code_challenge"], pkce::generate_code_challenge(&verifier));
        assert_eq!(query["state"], request.state);
        assert_eq!(
            h.store.get_item("vk_oauth_state").unwrap().as_deref(),
            Some(request.state.as_str())
        );
    }

    #[tokio::test]
    async fn begin_fails_when_link_is_unavailable() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/yandex/v1/link");
                then.status(503);
            })
            .await;
        let h = Harness::new(&server.base_url());
        let flow = OAuthFlow::new(h.session.clone());

        let err = flow.begin(Provider::Yandex).await.unwrap_err();

        assert_eq!(err.status(), Some(reqwest::StatusCode::SERVICE_UNAVAILABLE));
        assert!(h.store.get_item("yandex_code_verifier").unwrap().is_none());
    }

    #[tokio::test]
    async fn complete_signs_in_known_account() {
        let server = MockServer::start_async().await;
        let exchange = mock_exchange(&server, Provider::Yandex, "code-1").await;
        let login = server
            .mock_async(|when, then| {
                when.method(POST).path("/yandex/v1/login/prov-tok");
                then.status(200)
                    .json_body(json!({ "access": "acc-9", "refresh": "ref-9" }));
            })
            .await;
        let register = server
            .mock_async(|when, then| {
                when.method(POST).path("/yandex/v1/registration/prov-tok");
                then.status(200);
            })
            .await;
        mock_validation(&server, "9").await;
        let h = Harness::new(&server.base_url());
        pending(&h, Provider::Yandex, "verifier-1", "st-1");
        let flow = OAuthFlow::new(h.session.clone());

        let success = flow
            .complete(Provider::Yandex, "code-1", Some("st-1"))
            .await
            .unwrap();

        exchange.assert_hits_async(1).await;
        login.assert_hits_async(1).await;
        register.assert_hits_async(0).await;
        assert_eq!(success.user_id, UserId::new("9"));
        assert!(!success.registered);
        assert_eq!(success.redirect_to, "/profile");
        assert!(h.session.state().is_authenticated());
        assert!(h.store.get_item("yandex_code_verifier").unwrap().is_none());
        assert!(h.store.get_item("yandex_oauth_state").unwrap().is_none());
        assert!(h.store.get_item(DEVICE_ID_KEY).unwrap().is_some());
    }

    #[tokio::test]
    async fn complete_registers_when_login_is_refused() {
        let server = MockServer::start_async().await;
        mock_exchange(&server, Provider::MailRu, "code-2").await;
        let login = server
            .mock_async(|when, then| {
                when.method(POST).path("/mail.ru/v1/login/prov-tok");
                then.status(404).json_body(json!({ "message": "unknown account" }));
            })
            .await;
        let register = server
            .mock_async(|when, then| {
                when.method(POST).path("/mail.ru/v1/registration/prov-tok");
                then.status(200)
                    .json_body(json!({ "access": "acc-9", "refresh": "ref-9" }));
            })
            .await;
        mock_validation(&server, "11").await;
        let h = Harness::new(&server.base_url());
        pending(&h, Provider::MailRu, "verifier-1", "st-2");
        let flow = OAuthFlow::new(h.session.clone());

        let success = flow
            .complete(Provider::MailRu, "code-2", Some("st-2"))
            .await
            .unwrap();

        login.assert_hits_async(1).await;
        register.assert_hits_async(1).await;
        assert!(success.registered);
        assert_eq!(success.user_id, UserId::new("11"));
    }

    #[tokio::test]
    async fn complete_reports_registration_failure() {
        let server = MockServer::start_async().await;
        mock_exchange(&server, Provider::Vk, "code-3").await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/vk/v1/login/prov-tok");
                then.status(404);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/vk/v1/registration/prov-tok");
                then.status(409).json_body(json!({ "detail": "email taken" }));
            })
            .await;
        let h = Harness::new(&server.base_url());
        pending(&h, Provider::Vk, "verifier-1", "st-3");
        let flow = OAuthFlow::new(h.session.clone());

        let failure = flow
            .complete(Provider::Vk, "code-3", Some("st-3"))
            .await
            .unwrap_err();

        assert_eq!(failure.step, OAuthStep::Register);
        assert!(matches!(
            failure.error,
            FlowError::Rejected { ref message, .. } if message.as_deref() == Some("email taken")
        ));
        assert!(!h.session.state().is_authenticated());
    }

    #[tokio::test]
    async fn complete_fails_when_session_refuses_tokens() {
        let server = MockServer::start_async().await;
        mock_exchange(&server, Provider::Vk, "code-4").await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/vk/v1/login/prov-tok");
                then.status(200)
                    .json_body(json!({ "access": "acc-9", "refresh": "ref-9" }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/validate/jwt/user/acc-9/ref-9");
                then.status(200).json_body(json!({ "result": false }));
            })
            .await;
        let h = Harness::new(&server.base_url());
        pending(&h, Provider::Vk, "verifier-1", "st-4");
        let flow = OAuthFlow::new(h.session.clone());

        let failure = flow
            .complete(Provider::Vk, "code-4", Some("st-4"))
            .await
            .unwrap_err();

        assert_eq!(failure.step, OAuthStep::Establish);
        assert!(matches!(failure.error, FlowError::SessionRefused));
        assert_eq!(h.notifier.notices(), vec![Notice::LoginRejected]);
        assert_eq!(h.stored_tokens(), (None, None));
    }

    #[tokio::test]
    async fn complete_rejects_state_mismatch_without_requests() {
        let server = MockServer::start_async().await;
        let exchange = mock_exchange(&server, Provider::Vk, "code-5").await;
        let h = Harness::new(&server.base_url());
        pending(&h, Provider::Vk, "verifier-1", "expected");
        let flow = OAuthFlow::new(h.session.clone());

        let failure = flow
            .complete(Provider::Vk, "code-5", Some("forged"))
            .await
            .unwrap_err();

        assert_eq!(failure.step, OAuthStep::Exchange);
        assert!(matches!(failure.error, FlowError::StateMismatch));
        exchange.assert_hits_async(0).await;
        // The verifier is single use even when the callback is rejected.
        assert!(h.store.get_item("vk_code_verifier").unwrap().is_none());
    }

    #[tokio::test]
    async fn complete_requires_pending_verifier_and_code() {
        let server = MockServer::start_async().await;
        let h = Harness::new(&server.base_url());
        let flow = OAuthFlow::new(h.session.clone());

        let failure = flow
            .complete(Provider::Yandex, "code", None)
            .await
            .unwrap_err();
        assert!(matches!(
            failure.error,
            FlowError::MissingVerifier(Provider::Yandex)
        ));

        pending(&h, Provider::Yandex, "verifier-1", "st");
        let failure = flow
            .complete(Provider::Yandex, "  ", Some("st"))
            .await
            .unwrap_err();
        assert_eq!(failure.step, OAuthStep::Exchange);
        assert!(matches!(failure.error, FlowError::MissingCode));
    }

    #[tokio::test]
    async fn complete_fails_at_exchange_without_provider_token() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/vk/v1/get/token/code-6");
                then.status(200).json_body(json!({ "access_token": null }));
            })
            .await;
        let h = Harness::new(&server.base_url());
        pending(&h, Provider::Vk, "verifier-1", "st-6");
        let flow = OAuthFlow::new(h.session.clone());

        let failure = flow
            .complete(Provider::Vk, "code-6", Some("st-6"))
            .await
            .unwrap_err();

        assert_eq!(failure.step, OAuthStep::Exchange);
        assert!(matches!(
            failure.error,
            FlowError::MissingField("access_token")
        ));
    }
}

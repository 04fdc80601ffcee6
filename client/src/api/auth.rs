use reqwest::Response;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::Instrument;

use super::{
    client::{encode_segment, error_message, ApiClient},
    types::{EmailLoginRequest, IssuedTokens, Provider, ProviderTokenResponse, RegistrationRequest},
};
use crate::error::FlowError;

impl ApiClient {
    pub async fn login_with_email(
        &self,
        email: &str,
        password: &str,
    ) -> Result<IssuedTokens, FlowError> {
        let request = EmailLoginRequest {
            email: email.to_string(),
            hash_password: password.to_string(),
        };
        let response = self
            .http_client()
            .post(self.registration_url("/api/v1/authorizations/login/email"))
            .json(&request)
            .send()
            .await?;

        let response = ensure_success(response).await?;
        decode(response).await
    }

    /// Creates an account. Some deployments answer with a token pair, others with an empty body.
    pub async fn register_account(
        &self,
        request: &RegistrationRequest,
    ) -> Result<IssuedTokens, FlowError> {
        let response = self
            .http_client()
            .post(self.registration_url("/authorization/v1/registration"))
            .json(request)
            .send()
            .await?;

        let response = ensure_success(response).await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes).unwrap_or_default())
    }

    /// Authorize URL of `provider`, served as a JSON string or as plain text.
    pub async fn oauth_link(&self, provider: Provider) -> Result<String, FlowError> {
        let url = self.registration_url(&format!("/{}/v1/link", provider.path()));
        let response = ensure_success(self.http_client().get(&url).send().await?).await?;
        let text = response.text().await?;

        let link = match serde_json::from_str::<Value>(&text) {
            Ok(Value::String(link)) => link,
            _ => text.trim().trim_matches('"').to_string(),
        };
        if link.is_empty() {
            return Err(FlowError::MissingField("link"));
        }
        Ok(link)
    }

    /// Trades the authorization `code` for a provider access token.
    pub async fn exchange_code(
        &self,
        provider: Provider,
        code: &str,
        device_id: &str,
        code_verifier: &str,
    ) -> Result<String, FlowError> {
        let url = self.registration_url(&format!(
            "/{}/v1/get/token/{}",
            provider.path(),
            encode_segment(code)
        ));
        let span = tracing::debug_span!("exchange_code", %provider);

        async move {
            let response = self
                .http_client()
                .get(&url)
                .query(&[("device_id", device_id), ("code_verifier", code_verifier)])
                .send()
                .await?;
            let body: ProviderTokenResponse = decode(ensure_success(response).await?).await?;
            body.access_token
                .filter(|t| !t.trim().is_empty())
                .ok_or(FlowError::MissingField("access_token"))
        }
        .instrument(span)
        .await
    }

    pub async fn provider_login(
        &self,
        provider: Provider,
        provider_token: &str,
    ) -> Result<IssuedTokens, FlowError> {
        self.provider_call(provider, "login", provider_token).await
    }

    pub async fn provider_register(
        &self,
        provider: Provider,
        provider_token: &str,
    ) -> Result<IssuedTokens, FlowError> {
        self.provider_call(provider, "registration", provider_token)
            .await
    }

    async fn provider_call(
        &self,
        provider: Provider,
        action: &str,
        provider_token: &str,
    ) -> Result<IssuedTokens, FlowError> {
        let url = self.registration_url(&format!(
            "/{}/v1/{}/{}",
            provider.path(),
            action,
            encode_segment(provider_token)
        ));
        let response = self.http_client().post(&url).send().await?;
        decode(ensure_success(response).await?).await
    }
}

async fn ensure_success(response: Response) -> Result<Response, FlowError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = error_message(response).await;
    tracing::debug!(%status, message = message.as_deref().unwrap_or(""), "request refused");
    Err(FlowError::Rejected { status, message })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, FlowError> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| FlowError::Decode(e.to_string()))
}

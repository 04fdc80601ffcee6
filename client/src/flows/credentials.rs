//! Email/password sign-in and account registration.

use std::sync::Arc;

use crate::{
    api::{IssuedTokens, RegistrationRequest, UserId},
    error::FlowError,
    state::session::SessionManager,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// The service issued tokens with the new account and the session adopted them.
    SignedIn(UserId),
    /// Account created; the user still has to sign in.
    Created,
}

pub struct CredentialsFlow {
    session: Arc<SessionManager>,
}

impl CredentialsFlow {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }

    /// Signs in with email and password.
    ///
    /// A refusal carries the server message; check
    /// [`FlowError::needs_registration`] to offer the registration form.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<UserId, FlowError> {
        let tokens = self
            .session
            .api()
            .login_with_email(email.trim(), password)
            .await
            .map_err(|err| {
                tracing::warn!(error = %err, "email sign-in refused");
                err
            })?;
        self.establish(tokens).await
    }

    pub async fn register(
        &self,
        request: &RegistrationRequest,
    ) -> Result<RegistrationOutcome, FlowError> {
        let tokens = self.session.api().register_account(request).await?;
        if tokens.is_empty() {
            tracing::info!("account created without a session");
            return Ok(RegistrationOutcome::Created);
        }
        self.establish(tokens).await.map(RegistrationOutcome::SignedIn)
    }

    async fn establish(&self, tokens: IssuedTokens) -> Result<UserId, FlowError> {
        if !self
            .session
            .login_values(&tokens.access, &tokens.refresh)
            .await
        {
            return Err(FlowError::SessionRefused);
        }
        self.session
            .user()
            .map(|user| user.id)
            .ok_or(FlowError::SessionRefused)
    }
}

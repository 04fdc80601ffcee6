//! Ways of obtaining a token pair before handing it to the session.

pub mod credentials;
pub mod oauth;
pub mod pkce;

pub use credentials::{CredentialsFlow, RegistrationOutcome};
pub use oauth::{AuthorizationRequest, OAuthFailure, OAuthFlow, OAuthStep, OAuthSuccess};

use std::sync::Arc;

use parking_lot::Mutex;
use reqwest::{Response, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use crate::{
    api::{mask_token, ApiClient, RequestOptions, TokenPair, UserId},
    error::{SessionError, StorageError},
    notify::{Navigator, Notice, Notifier, TracingNavigator, TracingNotifier},
    utils::storage::KeyValueStore,
};

pub const ACCESS_TOKEN_KEY: &str = "access_token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionUser {
    pub logged_in: bool,
    pub id: UserId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Unauthenticated,
    Validating,
    Authenticated,
}

/// What consumers observe. `phase` is derived from `user` and the bootstrap flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionState {
    pub user: Option<SessionUser>,
    pub loading: bool,
    pub phase: SessionPhase,
}

impl SessionState {
    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }
}

#[derive(Debug, Default)]
struct Inner {
    tokens: Option<TokenPair>,
    user: Option<SessionUser>,
    bootstrapping: bool,
    pending_logins: usize,
    // Newest ticket handed to a validation or teardown.
    issued: u64,
    // Ticket of the newest attempt that changed the session. Only attempts
    // issued after it may still commit, so failed attempts supersede nothing.
    committed: u64,
}

impl Inner {
    fn snapshot(&self) -> SessionState {
        let phase = if self.user.is_some() {
            SessionPhase::Authenticated
        } else if self.bootstrapping {
            SessionPhase::Validating
        } else {
            SessionPhase::Unauthenticated
        };
        SessionState {
            user: self.user.clone(),
            loading: self.bootstrapping || self.pending_logins > 0,
            phase,
        }
    }

    fn issue_ticket(&mut self) -> u64 {
        self.issued += 1;
        self.issued
    }

    fn may_commit(&self, ticket: u64) -> bool {
        ticket > self.committed
    }

    /// Commits a fresh ticket, superseding every attempt still in flight.
    fn supersede_all(&mut self) {
        self.committed = self.issue_ticket();
    }
}

/// Why a session is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    UserRequested,
    Unauthorized,
}

/// Owns the authentication session: stored tokens, validation, authenticated
/// requests and teardown.
///
/// Construct one per client, call [`bootstrap`](Self::bootstrap) once at startup,
/// and share it behind an `Arc`.
pub struct SessionManager {
    api: ApiClient,
    store: Arc<dyn KeyValueStore>,
    notifier: Arc<dyn Notifier>,
    navigator: Arc<dyn Navigator>,
    inner: Mutex<Inner>,
    state: watch::Sender<SessionState>,
}

impl SessionManager {
    pub fn new(api: ApiClient, store: Arc<dyn KeyValueStore>) -> Self {
        // Bootstrap has not run yet, so the session starts out loading.
        let inner = Inner {
            bootstrapping: true,
            ..Inner::default()
        };
        let (state, _) = watch::channel(inner.snapshot());
        Self {
            api,
            store,
            notifier: Arc::new(TracingNotifier),
            navigator: Arc::new(TracingNavigator),
            inner: Mutex::new(inner),
            state,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_navigator(mut self, navigator: Arc<dyn Navigator>) -> Self {
        self.navigator = navigator;
        self
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn user(&self) -> Option<SessionUser> {
        self.state.borrow().user.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.state.borrow().loading
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.borrow().phase
    }

    pub(crate) fn tokens(&self) -> Option<TokenPair> {
        self.inner.lock().tokens.clone()
    }

    /// Resolves once no bootstrap or login validation is in flight.
    pub async fn ready(&self) -> SessionState {
        let mut rx = self.subscribe();
        let result = rx.wait_for(|state| !state.loading).await.map(|s| s.clone());
        // The sender lives in `self`, so the channel cannot close while we wait.
        result.unwrap_or_else(|_| self.state())
    }

    fn publish(&self, inner: &Inner) {
        self.state.send_replace(inner.snapshot());
    }

    /// Restores the session persisted by a previous run. Call once at startup.
    pub async fn bootstrap(&self) -> SessionState {
        let stored = self.load_stored_tokens();

        let (tokens, ticket) = {
            let mut inner = self.inner.lock();
            match stored {
                Some(tokens) => {
                    inner.bootstrapping = true;
                    inner.tokens = Some(tokens.clone());
                    let ticket = inner.issue_ticket();
                    self.publish(&inner);
                    (tokens, ticket)
                }
                None => {
                    tracing::debug!("no stored tokens, starting unauthenticated");
                    inner.bootstrapping = false;
                    self.publish(&inner);
                    return inner.snapshot();
                }
            }
        };

        tracing::debug!(access = %mask_token(&tokens.access), "validating stored tokens");
        let result = self.api.validate_tokens(&tokens).await;

        let mut inner = self.inner.lock();
        inner.bootstrapping = false;
        let current = inner.may_commit(ticket);
        let holds_pair = inner.tokens.as_ref() == Some(&tokens);

        match result {
            Ok(id) if current && holds_pair => {
                tracing::info!(user_id = %id, "restored session from storage");
                inner.committed = ticket;
                inner.user = Some(SessionUser {
                    logged_in: true,
                    id,
                });
                self.publish(&inner);
                inner.snapshot()
            }
            Ok(_) => {
                tracing::debug!("bootstrap validation superseded, discarding result");
                self.publish(&inner);
                inner.snapshot()
            }
            Err(err) => {
                let expired = current && holds_pair;
                if expired {
                    tracing::warn!(error = %err, "stored tokens failed validation, purging");
                    inner.tokens = None;
                    inner.user = None;
                } else {
                    tracing::debug!(error = %err, "superseded bootstrap validation failed");
                }
                // Only a newer commit of this very pair keeps it in storage.
                if (current || !holds_pair) && self.stored_pair_is(&tokens) {
                    self.purge_storage();
                }
                self.publish(&inner);
                let snapshot = inner.snapshot();
                drop(inner);

                if expired {
                    if err.is_transport() {
                        self.notifier.notify(Notice::Connectivity);
                    } else {
                        self.notifier.notify(Notice::SessionExpired);
                        self.navigator.navigate(&self.api.config().login_route);
                    }
                }
                snapshot
            }
        }
    }

    /// Validates and adopts a token pair. Returns `false` and leaves the session
    /// untouched when the pair is malformed or refused.
    pub async fn login(&self, access: &str, refresh: &str) -> bool {
        match TokenPair::new(access, refresh) {
            Ok(tokens) => self.login_pair(tokens).await,
            Err(err) => self.login_failed(err),
        }
    }

    /// `login` for tokens taken straight out of a JSON body.
    pub async fn login_values(&self, access: &Value, refresh: &Value) -> bool {
        match TokenPair::from_values(access, refresh) {
            Ok(tokens) => self.login_pair(tokens).await,
            Err(err) => self.login_failed(err),
        }
    }

    pub async fn login_pair(&self, tokens: TokenPair) -> bool {
        match self.try_login(tokens).await {
            Ok(id) => {
                tracing::info!(user_id = %id, "signed in");
                true
            }
            Err(err) => self.login_failed(err),
        }
    }

    fn login_failed(&self, err: SessionError) -> bool {
        tracing::warn!(error = %err, "login failed");
        let notice = match err {
            SessionError::Superseded => None,
            SessionError::InvalidTokenFormat => Some(Notice::InvalidTokenFormat),
            SessionError::Transport(_) => Some(Notice::Connectivity),
            SessionError::Storage(_) => Some(Notice::StorageUnavailable),
            _ => Some(Notice::LoginRejected),
        };
        if let Some(notice) = notice {
            self.notifier.notify(notice);
        }
        false
    }

    async fn try_login(&self, tokens: TokenPair) -> Result<UserId, SessionError> {
        let pending = PendingLogin::enter(self);
        let result = self.api.validate_tokens(&tokens).await;

        let mut inner = self.inner.lock();
        let id = result?;
        if !inner.may_commit(pending.ticket) {
            return Err(SessionError::Superseded);
        }
        self.persist_tokens(&mut inner, &tokens)?;
        inner.committed = pending.ticket;
        inner.tokens = Some(tokens);
        inner.user = Some(SessionUser {
            logged_in: true,
            id: id.clone(),
        });
        self.publish(&inner);
        Ok(id)
    }

    /// Sends `options` to `url` with the session headers attached.
    ///
    /// `None` means either the server was unreachable or it answered 401; in the
    /// latter case the session has already been torn down and the user should
    /// be sent to the login route. Any other response is handed back untouched.
    pub async fn fetch_with_auth(&self, url: &str, options: RequestOptions) -> Option<Response> {
        let tokens = self.tokens();
        let method = options.method.clone();

        let sent = self
            .api
            .send_authenticated(url, options, tokens.as_ref())
            .await;
        match sent.and_then(reject_unauthorized) {
            Ok(response) => Some(response),
            Err(SessionError::Unauthorized) => {
                tracing::warn!(%method, url, "request unauthorized, ending session");
                self.end_session(Teardown::Unauthorized).await;
                None
            }
            Err(err) => {
                tracing::warn!(%method, url, error = %err, "authenticated request failed");
                self.notifier.notify(Notice::Connectivity);
                None
            }
        }
    }

    /// Ends the session and returns the user to the landing route. Safe to call repeatedly.
    pub async fn logout(&self) {
        self.end_session(Teardown::UserRequested).await;
    }

    async fn end_session(&self, reason: Teardown) {
        let tokens = self.tokens();
        let had_session = tokens.is_some();

        let remote = match (reason, tokens) {
            (Teardown::UserRequested, Some(tokens)) => Some(self.remote_logout(&tokens).await),
            _ => None,
        };

        self.teardown();

        let config = self.api.config();
        match reason {
            Teardown::UserRequested => {
                if let Some(confirmed) = remote {
                    self.notifier.notify(if confirmed {
                        Notice::LoggedOut
                    } else {
                        Notice::LogoutFailed
                    });
                }
                self.navigator.navigate(&config.landing_route);
            }
            Teardown::Unauthorized => {
                if had_session {
                    self.notifier.notify(Notice::SessionExpired);
                }
                self.navigator.navigate(&config.login_route);
            }
        }
    }

    async fn remote_logout(&self, tokens: &TokenPair) -> bool {
        let url = self.api.logout_url();
        match self
            .api
            .send_authenticated(&url, RequestOptions::get(), Some(tokens))
            .await
        {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::debug!(status = %response.status(), "remote logout refused");
                false
            }
            Err(err) => {
                tracing::debug!(error = %err, "remote logout failed");
                false
            }
        }
    }

    /// Drops tokens and user from memory and storage, superseding in-flight validations.
    fn teardown(&self) {
        let mut inner = self.inner.lock();
        inner.supersede_all();
        inner.tokens = None;
        inner.user = None;
        self.purge_storage();
        self.publish(&inner);
    }

    fn load_stored_tokens(&self) -> Option<TokenPair> {
        let read = |key: &str| -> Result<Option<String>, StorageError> {
            Ok(self.store.get_item(key)?.filter(|v| !v.trim().is_empty()))
        };
        let pair = read(ACCESS_TOKEN_KEY).and_then(|a| Ok((a, read(REFRESH_TOKEN_KEY)?)));

        match pair {
            Ok((Some(access), Some(refresh))) => match TokenPair::new(&access, &refresh) {
                Ok(tokens) => Some(tokens),
                Err(_) => {
                    tracing::warn!("stored tokens are malformed, purging");
                    self.purge_storage();
                    None
                }
            },
            Ok((None, None)) => None,
            Ok(_) => {
                tracing::warn!("found half of a token pair in storage, purging");
                self.purge_storage();
                None
            }
            Err(err) => {
                tracing::warn!(error = %err, "could not read stored tokens");
                self.notifier.notify(Notice::StorageUnavailable);
                None
            }
        }
    }

    /// Writes both tokens or puts back what was stored before.
    ///
    /// If even that fails, storage is purged and the in-memory session ends with it.
    fn persist_tokens(&self, inner: &mut Inner, tokens: &TokenPair) -> Result<(), StorageError> {
        let previous = (
            self.store.get_item(ACCESS_TOKEN_KEY),
            self.store.get_item(REFRESH_TOKEN_KEY),
        );
        let written = self
            .store
            .set_item(ACCESS_TOKEN_KEY, &tokens.access)
            .and_then(|_| self.store.set_item(REFRESH_TOKEN_KEY, &tokens.refresh));
        let Err(err) = written else {
            return Ok(());
        };

        let restored = match previous {
            (Ok(access), Ok(refresh)) => self
                .put_or_remove(ACCESS_TOKEN_KEY, access.as_deref())
                .and_then(|_| self.put_or_remove(REFRESH_TOKEN_KEY, refresh.as_deref())),
            (Err(e), _) | (_, Err(e)) => Err(e),
        };
        if let Err(restore_err) = restored {
            tracing::warn!(
                error = %restore_err,
                "could not restore previous tokens, ending session"
            );
            self.purge_storage();
            if inner.tokens.is_some() || inner.user.is_some() {
                inner.supersede_all();
                inner.tokens = None;
                inner.user = None;
                self.publish(inner);
            }
        }
        Err(err)
    }

    fn put_or_remove(&self, key: &str, value: Option<&str>) -> Result<(), StorageError> {
        match value {
            Some(value) => self.store.set_item(key, value),
            None => self.store.remove_item(key),
        }
    }

    fn stored_pair_is(&self, tokens: &TokenPair) -> bool {
        let read = |key: &str| self.store.get_item(key).ok().flatten();
        read(ACCESS_TOKEN_KEY).as_deref() == Some(tokens.access.as_str())
            && read(REFRESH_TOKEN_KEY).as_deref() == Some(tokens.refresh.as_str())
    }

    fn purge_storage(&self) {
        for key in [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY] {
            if let Err(err) = self.store.remove_item(key) {
                tracing::warn!(key, error = %err, "failed to remove stored token");
            }
        }
    }
}

fn reject_unauthorized(response: Response) -> Result<Response, SessionError> {
    if response.status() == StatusCode::UNAUTHORIZED {
        return Err(SessionError::Unauthorized);
    }
    Ok(response)
}

/// Marks a login validation as in flight for as long as it lives.
struct PendingLogin<'a> {
    manager: &'a SessionManager,
    ticket: u64,
}

impl<'a> PendingLogin<'a> {
    fn enter(manager: &'a SessionManager) -> Self {
        let mut inner = manager.inner.lock();
        inner.pending_logins += 1;
        let ticket = inner.issue_ticket();
        manager.publish(&inner);
        Self { manager, ticket }
    }
}

impl Drop for PendingLogin<'_> {
    fn drop(&mut self) {
        let mut inner = self.manager.inner.lock();
        inner.pending_logins = inner.pending_logins.saturating_sub(1);
        self.manager.publish(&inner);
    }
}

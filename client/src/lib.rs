//! Client-side session handling for the campus portal.
//!
//! [`SessionManager`] owns the token pair: it restores it at startup, validates
//! new pairs, attaches it to outgoing requests and tears it down on logout or
//! on a 401. The [`flows`] module obtains pairs from credentials or from an
//! external identity provider.

pub mod api;
pub mod config;
pub mod error;
pub mod flows;
pub mod notify;
pub mod state;
pub mod utils;

#[cfg(all(test, not(target_arch = "wasm32")))]
mod test_support;

pub use api::{ApiClient, Provider, RequestBody, RequestOptions, TokenPair, UserId};
pub use config::ClientConfig;
pub use error::{FlowError, SessionError, StorageError};
pub use notify::{Navigator, Notice, Notifier, TracingNavigator, TracingNotifier};
pub use state::{SessionManager, SessionPhase, SessionState, SessionUser};
pub use utils::storage::{FileStore, KeyValueStore, MemoryStore};

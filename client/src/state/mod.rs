pub mod session;

pub use session::{SessionManager, SessionPhase, SessionState, SessionUser};

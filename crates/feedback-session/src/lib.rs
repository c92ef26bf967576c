//! Client-side session lifecycle and optimistic voting for the feedback board.

pub mod api;
pub mod error;
pub mod events;
pub mod monitor;
pub mod optimistic;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod token;
pub mod transport;

pub use api::ApiClient;
pub use error::{ApiError, ApiResult};
pub use events::{EventBus, EventKind, Subscription};
pub use monitor::{MonitorConfig, SessionHooks, SessionMonitor, SessionState};
pub use optimistic::{EntityCache, EntityId, MutationCoordinator, MutationError, Reconciled};
pub use session::AuthSession;
pub use storage::StorageAdapter;
pub use token::Credential;

/// Server used when neither `--api-url` nor `FEEDBACK_API_URL` is set.
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8000";

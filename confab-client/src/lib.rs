pub mod auth;
pub mod channel;
pub mod error;
pub mod history;
pub mod sync;

pub use auth::AuthClient;
pub use channel::{ChannelStreams, EventChannel, LifecycleEvent};
pub use error::{AuthError, ChannelError, FetchError};
pub use history::HistoryClient;
pub use sync::{SyncCommand, SyncHandle, SyncUpdate, Synchronizer};

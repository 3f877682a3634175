// annosync-client: annotation sync core embedded in a host viewer.

pub mod config;
pub mod engine;
pub mod error;
pub mod remote;
pub mod session;
pub mod store;
pub mod viewer;

pub use engine::{RetryPolicy, SyncEngine};
pub use error::{IndexError, RemoteError, SyncError};
pub use session::{SessionContext, SyncClient};

mod cancel;
mod error;
mod types;

pub use cancel::{cancellation, CancelHandle, CancelToken};
pub use error::{ErrorCode, OperatorError, Result};
pub use types::{Address, Digest32, MemberId, SessionId};

mod bridge;
mod lifecycle;
mod preparams_pool;
mod session;

pub use bridge::{BridgeStreams, NetworkBridge};
pub use lifecycle::{honest_majority_threshold, KeepLifecycle, LifecycleConfig};
pub use preparams_pool::PreParamsPool;
pub use session::{run_keygen, run_signing, NonceLedger, SessionOptions, DEFAULT_READY_TIMEOUT};

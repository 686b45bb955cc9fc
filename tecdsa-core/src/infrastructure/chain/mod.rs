//! Chain facade.
//!
//! The operator consumes the ledger exclusively through [`Chain`]: keep
//! creation and signature-request subscriptions, public key and signature
//! submission, the block counter, and the operator's chain identity. A live
//! ledger client plugs in behind this trait; the in-process [`LocalChain`]
//! ships here for local runs and tests.

mod block_counter;
mod local;

pub use block_counter::{HeadSubscription, RelayedBlockCounter, SUBSCRIPTION_RETRY_INITIAL_BACKOFF};
pub use local::{LocalChain, LocalChainHandle, SubmittedSignature};

use crate::foundation::{Address, CancelToken, Digest32, MemberId, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A keep was opened on-chain with the given signing group.
#[derive(Clone, Debug)]
pub struct KeepCreatedEvent {
    pub keep_address: Address,
    pub members: Vec<MemberId>,
}

/// The keep was asked to sign a digest.
#[derive(Clone, Debug)]
pub struct SignatureRequestedEvent {
    pub digest: Digest32,
}

pub type KeepCreatedHandler = Arc<dyn Fn(KeepCreatedEvent) + Send + Sync>;
pub type SignatureRequestedHandler = Arc<dyn Fn(SignatureRequestedEvent) + Send + Sync>;

#[async_trait]
pub trait Chain: Send + Sync {
    /// The operator's chain identity, derived from its key.
    fn operator_address(&self) -> Address;

    async fn on_keep_created(&self, handler: KeepCreatedHandler) -> Result<()>;

    async fn on_signature_requested(
        &self,
        keep_address: Address,
        handler: SignatureRequestedHandler,
    ) -> Result<()>;

    /// Publishes the group public key: 64 bytes, X‖Y, zero-padded.
    async fn submit_public_key(&self, keep_address: Address, public_key: [u8; 64]) -> Result<()>;

    /// Submits a calculated signature; `v` is the recovery id plus 27.
    async fn submit_signature(
        &self,
        keep_address: Address,
        digest: Digest32,
        r: [u8; 32],
        s: [u8; 32],
        v: u8,
    ) -> Result<()>;

    fn block_counter(&self) -> Arc<dyn BlockCounter>;
}

#[async_trait]
pub trait BlockCounter: Send + Sync {
    /// Returns once the observed chain height is at least `height`. Never
    /// returns early; heights at or below the current one return
    /// immediately.
    async fn wait_for_block_height(&self, height: u64) -> Result<()>;

    /// A lazy stream of strictly increasing block heights, starting at the
    /// next observed block. Heights a slow consumer misses are dropped for
    /// that consumer only. The stream ends on cancellation.
    fn watch_blocks(&self, cancel: CancelToken) -> mpsc::Receiver<u64>;
}

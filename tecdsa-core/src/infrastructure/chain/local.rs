use crate::foundation::{Address, Digest32, MemberId, OperatorError, Result};
use crate::infrastructure::chain::{
    BlockCounter, Chain, KeepCreatedEvent, KeepCreatedHandler, RelayedBlockCounter, SignatureRequestedEvent,
    SignatureRequestedHandler,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// A signature recorded by the in-process chain.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubmittedSignature {
    pub digest: Digest32,
    pub r: [u8; 32],
    pub s: [u8; 32],
    pub v: u8,
}

struct LocalKeep {
    members: Vec<MemberId>,
    public_key: Option<[u8; 64]>,
    signature_handlers: Vec<SignatureRequestedHandler>,
    signatures: Vec<SubmittedSignature>,
}

struct LocalChainState {
    height: u64,
    keeps: HashMap<Address, LocalKeep>,
    keep_created_handlers: Vec<KeepCreatedHandler>,
    fail_public_key_submission: bool,
}

/// In-process ledger used by local runs and the test suite. One instance is
/// shared by every operator of a run; each operator talks to it through its
/// own [`LocalChainHandle`].
pub struct LocalChain {
    counter: Arc<RelayedBlockCounter>,
    state: Mutex<LocalChainState>,
}

impl LocalChain {
    pub fn new(initial_height: u64) -> Arc<Self> {
        Arc::new(Self {
            counter: RelayedBlockCounter::new(initial_height),
            state: Mutex::new(LocalChainState {
                height: initial_height,
                keeps: HashMap::new(),
                keep_created_handlers: Vec::new(),
                fail_public_key_submission: false,
            }),
        })
    }

    /// An operator's view of this chain.
    pub fn handle(self: &Arc<Self>, operator_address: Address) -> Arc<LocalChainHandle> {
        Arc::new(LocalChainHandle { chain: self.clone(), operator_address })
    }

    /// Opens a keep with the given signing group and notifies subscribers.
    pub fn create_keep(&self, keep_address: Address, members: Vec<MemberId>) -> Result<()> {
        let handlers = {
            let mut state = self.state.lock().expect("chain lock");
            if state.keeps.contains_key(&keep_address) {
                return Err(OperatorError::KeepExists(keep_address));
            }
            state.keeps.insert(
                keep_address,
                LocalKeep {
                    members: members.clone(),
                    public_key: None,
                    signature_handlers: Vec::new(),
                    signatures: Vec::new(),
                },
            );
            state.keep_created_handlers.clone()
        };

        info!(keep = %keep_address, members = members.len(), "keep created");
        let event = KeepCreatedEvent { keep_address, members };
        for handler in handlers {
            let event = event.clone();
            tokio::spawn(async move { handler(event) });
        }
        Ok(())
    }

    /// Asks the keep's group to sign a digest.
    pub fn request_signature(&self, keep_address: Address, digest: Digest32) -> Result<()> {
        let handlers = {
            let state = self.state.lock().expect("chain lock");
            let keep = state.keeps.get(&keep_address).ok_or(OperatorError::KeepNotFound(keep_address))?;
            keep.signature_handlers.clone()
        };

        debug!(keep = %keep_address, digest = %hex::encode(digest), "signature requested");
        for handler in handlers {
            let event = SignatureRequestedEvent { digest };
            tokio::spawn(async move { handler(event) });
        }
        Ok(())
    }

    /// Advances the chain by one block.
    pub fn mine_block(&self) {
        let height = {
            let mut state = self.state.lock().expect("chain lock");
            state.height += 1;
            state.height
        };
        self.counter.notify_height(height);
    }

    pub fn submitted_public_key(&self, keep_address: &Address) -> Option<[u8; 64]> {
        let state = self.state.lock().expect("chain lock");
        state.keeps.get(keep_address).and_then(|keep| keep.public_key)
    }

    pub fn submitted_signatures(&self, keep_address: &Address) -> Vec<SubmittedSignature> {
        let state = self.state.lock().expect("chain lock");
        state.keeps.get(keep_address).map(|keep| keep.signatures.clone()).unwrap_or_default()
    }

    pub fn keep_members(&self, keep_address: &Address) -> Option<Vec<MemberId>> {
        let state = self.state.lock().expect("chain lock");
        state.keeps.get(keep_address).map(|keep| keep.members.clone())
    }

    /// Number of signature-request handlers registered for a keep. Local
    /// runs use this to know when every member is serving the keep.
    pub fn signature_handler_count(&self, keep_address: &Address) -> usize {
        let state = self.state.lock().expect("chain lock");
        state.keeps.get(keep_address).map(|keep| keep.signature_handlers.len()).unwrap_or(0)
    }

    /// Makes every following public key submission fail permanently, for
    /// exercising the stuck-keep path.
    pub fn set_public_key_submission_failing(&self, failing: bool) {
        self.state.lock().expect("chain lock").fail_public_key_submission = failing;
    }
}

/// One operator's connection to a [`LocalChain`].
pub struct LocalChainHandle {
    chain: Arc<LocalChain>,
    operator_address: Address,
}

#[async_trait]
impl Chain for LocalChainHandle {
    fn operator_address(&self) -> Address {
        self.operator_address
    }

    async fn on_keep_created(&self, handler: KeepCreatedHandler) -> Result<()> {
        let mut state = self.chain.state.lock().expect("chain lock");
        state.keep_created_handlers.push(handler);
        Ok(())
    }

    async fn on_signature_requested(
        &self,
        keep_address: Address,
        handler: SignatureRequestedHandler,
    ) -> Result<()> {
        let mut state = self.chain.state.lock().expect("chain lock");
        let keep = state.keeps.get_mut(&keep_address).ok_or(OperatorError::KeepNotFound(keep_address))?;
        keep.signature_handlers.push(handler);
        Ok(())
    }

    async fn submit_public_key(&self, keep_address: Address, public_key: [u8; 64]) -> Result<()> {
        let mut state = self.chain.state.lock().expect("chain lock");
        if state.fail_public_key_submission {
            return Err(OperatorError::ChainPermanent {
                operation: "submit public key".to_string(),
                details: "transaction rejected".to_string(),
            });
        }
        let keep = state.keeps.get_mut(&keep_address).ok_or(OperatorError::KeepNotFound(keep_address))?;
        match keep.public_key {
            Some(existing) if existing != public_key => Err(OperatorError::ChainPermanent {
                operation: "submit public key".to_string(),
                details: format!("conflicting public key already submitted for keep [{}]", keep_address),
            }),
            _ => {
                keep.public_key = Some(public_key);
                info!(keep = %keep_address, operator = %self.operator_address, "public key submitted");
                Ok(())
            }
        }
    }

    async fn submit_signature(
        &self,
        keep_address: Address,
        digest: Digest32,
        r: [u8; 32],
        s: [u8; 32],
        v: u8,
    ) -> Result<()> {
        let mut state = self.chain.state.lock().expect("chain lock");
        let keep = state.keeps.get_mut(&keep_address).ok_or(OperatorError::KeepNotFound(keep_address))?;
        keep.signatures.push(SubmittedSignature { digest, r, s, v });
        info!(keep = %keep_address, operator = %self.operator_address, "signature submitted");
        Ok(())
    }

    fn block_counter(&self) -> Arc<dyn BlockCounter> {
        self.chain.counter.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc::unbounded_channel;

    fn address(last: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[19] = last;
        Address::new(bytes)
    }

    #[tokio::test]
    async fn request_signature_for_unknown_keep_fails_without_side_effects() {
        let chain = LocalChain::new(0);
        let err = chain.request_signature(address(1), [1u8; 32]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to find keep with address: [0x0000000000000000000000000000000000000001]"
        );
        assert!(chain.submitted_signatures(&address(1)).is_empty());
    }

    #[tokio::test]
    async fn request_signature_with_no_handler_succeeds() {
        let chain = LocalChain::new(0);
        chain.create_keep(address(1), vec![MemberId::new(vec![1])]).expect("create");
        chain.request_signature(address(1), [1u8; 32]).expect("request");
    }

    #[tokio::test]
    async fn signature_request_reaches_registered_handler() {
        let chain = LocalChain::new(0);
        let operator = address(9);
        chain.create_keep(address(1), vec![MemberId::new(vec![1])]).expect("create");

        let handle = chain.handle(operator);
        let (tx, mut rx) = unbounded_channel();
        handle
            .on_signature_requested(
                address(1),
                Arc::new(move |event| {
                    let _ = tx.send(event.digest);
                }),
            )
            .await
            .expect("subscribe");

        let digest = [1u8; 32];
        chain.request_signature(address(1), digest).expect("request");
        let delivered = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.expect("timely").expect("event");
        assert_eq!(delivered, digest);
    }

    #[tokio::test]
    async fn create_keep_twice_fails() {
        let chain = LocalChain::new(0);
        chain.create_keep(address(1), vec![MemberId::new(vec![1])]).expect("create");
        let err = chain.create_keep(address(1), vec![MemberId::new(vec![1])]).unwrap_err();
        assert_eq!(err.to_string(), "keep already exists for address [0x0000000000000000000000000000000000000001]");
    }

    #[tokio::test]
    async fn keep_created_event_reaches_subscribers() {
        let chain = LocalChain::new(0);
        let handle = chain.handle(address(9));
        let (tx, mut rx) = unbounded_channel();
        handle
            .on_keep_created(Arc::new(move |event| {
                let _ = tx.send((event.keep_address, event.members));
            }))
            .await
            .expect("subscribe");

        let members = vec![MemberId::new(vec![1]), MemberId::new(vec![2])];
        chain.create_keep(address(3), members.clone()).expect("create");
        let (keep, delivered) =
            tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.expect("timely").expect("event");
        assert_eq!(keep, address(3));
        assert_eq!(delivered, members);
    }

    #[tokio::test]
    async fn conflicting_public_key_is_rejected() {
        let chain = LocalChain::new(0);
        chain.create_keep(address(1), vec![MemberId::new(vec![1])]).expect("create");
        let handle = chain.handle(address(9));

        handle.submit_public_key(address(1), [1u8; 64]).await.expect("first submission");
        handle.submit_public_key(address(1), [1u8; 64]).await.expect("idempotent resubmission");
        let err = handle.submit_public_key(address(1), [2u8; 64]).await.unwrap_err();
        assert!(err.to_string().contains("conflicting public key"));
    }

    #[tokio::test]
    async fn mined_blocks_reach_the_counter() {
        let chain = LocalChain::new(100);
        let handle = chain.handle(address(9));
        let counter = handle.block_counter();

        for _ in 0..5 {
            chain.mine_block();
        }
        tokio::time::timeout(Duration::from_secs(1), counter.wait_for_block_height(105))
            .await
            .expect("timely")
            .expect("height reached");
    }
}

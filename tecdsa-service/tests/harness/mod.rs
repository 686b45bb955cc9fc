#![allow(dead_code)]

use k256::ecdsa::SigningKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand_core::OsRng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tecdsa_core::application::{KeepLifecycle, LifecycleConfig, SessionOptions};
use tecdsa_core::domain::{keccak_address, ThresholdSigner};
use tecdsa_core::foundation::{cancellation, Address, CancelHandle, MemberId, Result};
use tecdsa_core::infrastructure::chain::LocalChain;
use tecdsa_core::infrastructure::net::{LocalNetworkHub, LocalProvider, Provider};
use tecdsa_core::infrastructure::storage::{FileSignerStorage, SignerStorage};
use tempfile::TempDir;

pub struct TestOperator {
    pub address: Address,
    pub member_id: MemberId,
    pub network_key: SigningKey,
    pub provider: Arc<dyn Provider>,
    pub storage: Arc<dyn SignerStorage>,
    pub storage_dir: PathBuf,
    pub lifecycle: Arc<KeepLifecycle>,
    cancel: CancelHandle,
}

pub struct TestNetwork {
    pub chain: Arc<LocalChain>,
    pub hub: Arc<LocalNetworkHub>,
    pub operators: Vec<TestOperator>,
    temp_dir: TempDir,
}

pub fn test_session_options() -> SessionOptions {
    SessionOptions { ready_timeout: Duration::from_secs(5), protocol_timeout: Some(Duration::from_secs(30)) }
}

pub fn test_lifecycle_config() -> LifecycleConfig {
    LifecycleConfig {
        session: test_session_options(),
        pre_params_generation_timeout: Duration::from_secs(10),
        submit_attempts: 3,
        submit_initial_backoff: Duration::from_millis(50),
        dishonest_threshold: None,
    }
}

impl TestNetwork {
    pub async fn new(count: usize) -> Self {
        Self::build(count, false).await
    }

    pub async fn with_failing_storage(count: usize) -> Self {
        Self::build(count, true).await
    }

    async fn build(count: usize, failing_storage: bool) -> Self {
        let chain = LocalChain::new(0);
        let hub = LocalNetworkHub::new();
        let temp_dir = TempDir::new().expect("temp dir");

        let mut operators = Vec::with_capacity(count);
        for index in 0..count {
            let network_key = SigningKey::random(&mut OsRng);
            let storage_dir = temp_dir.path().join(format!("operator-{}", index));
            let storage: Arc<dyn SignerStorage> = if failing_storage {
                Arc::new(FailingStorage)
            } else {
                Arc::new(FileSignerStorage::new(&storage_dir).expect("storage"))
            };
            operators.push(spawn_operator(&chain, &hub, network_key, storage, storage_dir).await);
        }

        Self { chain, hub, operators, temp_dir }
    }

    /// Tears the operators down and brings them back with the same network
    /// keys, data dirs, and chain, as after a process restart.
    pub async fn restart(self) -> Self {
        let TestNetwork { chain, hub, operators, temp_dir } = self;

        let mut restarted = Vec::with_capacity(operators.len());
        for operator in operators {
            operator.cancel.cancel();
            let TestOperator { network_key, storage_dir, .. } = operator;
            let storage: Arc<dyn SignerStorage> =
                Arc::new(FileSignerStorage::new(&storage_dir).expect("storage"));
            restarted.push(spawn_operator(&chain, &hub, network_key, storage, storage_dir).await);
        }

        Self { chain, hub, operators: restarted, temp_dir }
    }

    /// Cancels one operator's lifecycle, as if its process died.
    pub fn shutdown_operator(&self, index: usize) {
        self.operators[index].cancel.cancel();
    }

    pub fn member_ids(&self) -> Vec<MemberId> {
        self.operators.iter().map(|op| op.member_id.clone()).collect()
    }

    pub fn create_keep(&self, last_byte: u8) -> Address {
        let address = keep_address(last_byte);
        self.chain.create_keep(address, self.member_ids()).expect("create keep");
        address
    }

    pub fn signer_of(&self, operator: usize, keep: &Address) -> Option<Arc<ThresholdSigner>> {
        self.operators[operator].lifecycle.signer_for(keep)
    }

    /// Waits until the keep's public key is on chain and every operator is
    /// serving signature requests for it.
    pub async fn wait_keep_ready(&self, keep: &Address, timeout: Duration) {
        wait_until(timeout, "keep ready", || {
            self.chain.submitted_public_key(keep).is_some()
                && (0..self.operators.len()).all(|index| self.signer_of(index, keep).is_some())
                && self.chain.signature_handler_count(keep) >= self.operators.len()
        })
        .await;
    }
}

async fn spawn_operator(
    chain: &Arc<LocalChain>,
    hub: &Arc<LocalNetworkHub>,
    network_key: SigningKey,
    storage: Arc<dyn SignerStorage>,
    storage_dir: PathBuf,
) -> TestOperator {
    let address = Address::new(keccak_address(network_key.verifying_key()));
    let public_key = network_key.verifying_key().to_encoded_point(false).as_bytes().to_vec();
    let provider: Arc<dyn Provider> = LocalProvider::connect(hub.clone(), &public_key).expect("provider");

    let (cancel, cancel_token) = cancellation();
    let lifecycle = KeepLifecycle::new(
        chain.handle(address),
        provider.clone(),
        storage.clone(),
        test_lifecycle_config(),
        cancel_token,
    );
    lifecycle.start().await.expect("lifecycle start");

    TestOperator {
        address,
        member_id: MemberId::from(address),
        network_key,
        provider,
        storage,
        storage_dir,
        lifecycle,
        cancel,
    }
}

pub fn keep_address(last_byte: u8) -> Address {
    let mut bytes = [0u8; 20];
    bytes[19] = last_byte;
    Address::new(bytes)
}

pub async fn wait_until(timeout: Duration, what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Storage whose writes always fail, for exercising the
/// persist-before-publish rule.
pub struct FailingStorage;

impl SignerStorage for FailingStorage {
    fn save(&self, _signer: &ThresholdSigner) -> Result<()> {
        Err(tecdsa_core::foundation::OperatorError::persistence("write signer", "injected disk failure"))
    }

    fn load(&self, _keep_id: &str) -> Result<Option<ThresholdSigner>> {
        Ok(None)
    }

    fn load_all(&self) -> Result<Vec<ThresholdSigner>> {
        Ok(Vec::new())
    }
}

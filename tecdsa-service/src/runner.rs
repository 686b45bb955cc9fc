//! Run modes.
//!
//! `start` runs one operator against the chain backend resolved from
//! `Ethereum.URL`; this build embeds only the in-process `local` backend,
//! and a live ledger client plugs in behind the `Chain` trait.
//! `start-local` runs a self-contained three-member smoke group: in-memory
//! chain, in-memory network, one DKG, one verified signature.

use k256::ecdsa::SigningKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand_core::OsRng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tecdsa_core::application::{KeepLifecycle, LifecycleConfig};
use tecdsa_core::domain::{keccak_address, recover_address, Signature};
use tecdsa_core::foundation::{cancellation, Address, MemberId, OperatorError, Result};
use tecdsa_core::infrastructure::chain::{BlockCounter, Chain, LocalChain};
use tecdsa_core::infrastructure::config::Config;
use tecdsa_core::infrastructure::net::{LocalNetworkHub, LocalProvider, Provider};
use tecdsa_core::infrastructure::storage::FileSignerStorage;
use tracing::{info, warn};

const LOCAL_CHAIN_SCHEME: &str = "local";
const SMOKE_GROUP_SIZE: usize = 3;
const SMOKE_STEP_TIMEOUT: Duration = Duration::from_secs(60);
const BLOCK_MINING_INTERVAL: Duration = Duration::from_millis(500);

struct Operator {
    address: Address,
    lifecycle: Arc<KeepLifecycle>,
}

/// Runs the operator against the configured chain until interrupted.
pub async fn start(config: Config, broadcast_api: &str) -> Result<()> {
    config.validate()?;
    let scheme = config.ethereum.url.split("://").next().unwrap_or_default();
    if scheme != LOCAL_CHAIN_SCHEME {
        return Err(OperatorError::Config(format!(
            "unsupported chain url scheme [{}] in Ethereum.URL: this build embeds only the in-process [{}] backend",
            scheme, LOCAL_CHAIN_SCHEME
        )));
    }

    info!(broadcast_api, "starting operator");
    let lifecycle_config = lifecycle_config(&config)?;
    let (cancel_handle, cancel) = cancellation();
    let chain = LocalChain::new(0);
    let hub = LocalNetworkHub::new();
    let operator = spawn_operator(
        &chain,
        &hub,
        PathBuf::from(&config.storage.data_dir),
        lifecycle_config,
        cancel.clone(),
    )
    .await?;
    spawn_miner(chain.clone(), cancel.clone());
    spawn_height_reporter(chain.handle(operator.address).block_counter(), cancel.clone());

    tokio::signal::ctrl_c().await.map_err(|err| OperatorError::Message(err.to_string()))?;
    info!("shutdown signal received");
    cancel_handle.cancel();
    Ok(())
}

/// Runs a three-member group end to end on an in-memory chain and network:
/// one keep, one DKG, one signature request, recovery-checked result.
pub async fn start_local(config: Config) -> Result<()> {
    config.validate()?;
    info!(members = SMOKE_GROUP_SIZE, "starting local smoke group");

    let lifecycle_config = lifecycle_config(&config)?;
    let (cancel_handle, cancel) = cancellation();
    let chain = LocalChain::new(0);
    let hub = LocalNetworkHub::new();

    let mut operators = Vec::with_capacity(SMOKE_GROUP_SIZE);
    for index in 0..SMOKE_GROUP_SIZE {
        let data_dir = PathBuf::from(&config.storage.data_dir).join(format!("node-{}", index));
        operators
            .push(spawn_operator(&chain, &hub, data_dir, lifecycle_config.clone(), cancel.clone()).await?);
    }
    spawn_miner(chain.clone(), cancel.clone());

    // One mined block proves the chain side is live before the group forms.
    let counter = chain.handle(operators[0].address).block_counter();
    counter.wait_for_block_height(1).await?;
    spawn_height_reporter(counter, cancel.clone());

    let keep_address = smoke_keep_address();
    let members: Vec<MemberId> = operators.iter().map(|op| MemberId::from(op.address)).collect();
    chain.create_keep(keep_address, members)?;

    wait_until(SMOKE_STEP_TIMEOUT, "public key submission", || {
        chain.submitted_public_key(&keep_address).is_some()
            && chain.signature_handler_count(&keep_address) >= SMOKE_GROUP_SIZE
    })
    .await?;
    let public_key = chain.submitted_public_key(&keep_address).unwrap_or([0u8; 64]);
    info!(keep = %keep_address, public_key = %hex::encode(public_key), "keep public key on chain");

    let digest = *blake3::hash(b"tecdsa operator smoke digest").as_bytes();
    chain.request_signature(keep_address, digest)?;
    wait_until(SMOKE_STEP_TIMEOUT, "signature submission", || {
        !chain.submitted_signatures(&keep_address).is_empty()
    })
    .await?;

    let submitted = chain
        .submitted_signatures(&keep_address)
        .into_iter()
        .next()
        .ok_or_else(|| OperatorError::Message("signature disappeared from chain".to_string()))?;
    verify_submission(&operators[0], &keep_address, &chain, digest)?;
    info!(
        keep = %keep_address,
        v = submitted.v,
        r = %hex::encode(submitted.r),
        s = %hex::encode(submitted.s),
        "smoke run completed"
    );

    cancel_handle.cancel();
    Ok(())
}

/// The registration ticker, when configured, paces chain submission
/// retries.
fn lifecycle_config(config: &Config) -> Result<LifecycleConfig> {
    let mut lifecycle = LifecycleConfig::default();
    if let Some(ticker) = config.registration_ticker()? {
        lifecycle.submit_initial_backoff = ticker;
    }
    Ok(lifecycle)
}

async fn spawn_operator(
    chain: &Arc<LocalChain>,
    hub: &Arc<LocalNetworkHub>,
    data_dir: PathBuf,
    lifecycle_config: LifecycleConfig,
    cancel: tecdsa_core::foundation::CancelToken,
) -> Result<Operator> {
    let network_key = SigningKey::random(&mut OsRng);
    let address = Address::new(keccak_address(network_key.verifying_key()));
    let public_key = network_key.verifying_key().to_encoded_point(false).as_bytes().to_vec();

    let provider: Arc<dyn Provider> = LocalProvider::connect(hub.clone(), &public_key)?;
    let storage = Arc::new(FileSignerStorage::new(data_dir)?);
    let lifecycle = KeepLifecycle::new(chain.handle(address), provider, storage, lifecycle_config, cancel);
    lifecycle.start().await?;

    info!(operator = %address, "operator ready");
    Ok(Operator { address, lifecycle })
}

fn spawn_miner(chain: Arc<LocalChain>, cancel: tecdsa_core::foundation::CancelToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(BLOCK_MINING_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => chain.mine_block(),
            }
        }
    });
}

fn spawn_height_reporter(counter: Arc<dyn BlockCounter>, cancel: tecdsa_core::foundation::CancelToken) {
    tokio::spawn(async move {
        let mut heights = counter.watch_blocks(cancel);
        while let Some(height) = heights.recv().await {
            if height % 120 == 0 {
                info!(height, "chain height");
            }
        }
    });
}

fn smoke_keep_address() -> Address {
    let digest = blake3::hash(b"tecdsa operator smoke keep");
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&digest.as_bytes()[..20]);
    Address::new(bytes)
}

fn verify_submission(
    operator: &Operator,
    keep_address: &Address,
    chain: &Arc<LocalChain>,
    digest: [u8; 32],
) -> Result<()> {
    let signer = operator
        .lifecycle
        .signer_for(keep_address)
        .ok_or_else(|| OperatorError::Message("signer not loaded after keygen".to_string()))?;
    let group_key = signer.public_key()?;

    for submitted in chain.submitted_signatures(keep_address) {
        let signature =
            Signature { r: submitted.r, s: submitted.s, recovery_id: submitted.v.wrapping_sub(27) };
        let recovered = recover_address(&digest, &signature)?;
        if recovered != keccak_address(&group_key) {
            return Err(OperatorError::Message(
                "submitted signature does not recover to the group key".to_string(),
            ));
        }
    }
    Ok(())
}

async fn wait_until(
    timeout: Duration,
    what: &str,
    mut condition: impl FnMut() -> bool,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(what, "timed out waiting");
            return Err(OperatorError::Message(format!("timed out waiting for {}", what)));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

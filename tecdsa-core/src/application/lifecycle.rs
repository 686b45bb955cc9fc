use crate::application::preparams_pool::PreParamsPool;
use crate::application::session::{run_keygen, run_signing, NonceLedger, SessionOptions};
use crate::domain::{GroupInfo, ThresholdSigner};
use crate::foundation::{Address, CancelToken, Digest32, MemberId, OperatorError, Result};
use crate::infrastructure::chain::{Chain, KeepCreatedEvent, SignatureRequestedEvent};
use crate::infrastructure::net::Provider;
use crate::infrastructure::storage::SignerStorage;
use crate::protocol::DEFAULT_PRE_PARAMS_GENERATION_TIMEOUT;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const SUBMIT_RETRY_MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct LifecycleConfig {
    pub session: SessionOptions,
    pub pre_params_generation_timeout: Duration,
    /// Bounded retry budget for chain submissions.
    pub submit_attempts: u32,
    pub submit_initial_backoff: Duration,
    /// Dishonest threshold to run new keeps under. The chain's keep
    /// creation event carries only the membership, so the threshold is
    /// operator policy; unset, every keep uses the honest-majority
    /// maximum its group size admits.
    pub dishonest_threshold: Option<usize>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            session: SessionOptions::default(),
            pre_params_generation_timeout: DEFAULT_PRE_PARAMS_GENERATION_TIMEOUT,
            submit_attempts: 5,
            submit_initial_backoff: Duration::from_secs(1),
            dishonest_threshold: None,
        }
    }
}

/// The largest dishonest threshold a group of this size can run under the
/// honest-majority protocol (`n >= 2t+1`). Any `t+1` members can then sign,
/// so a three-member keep tolerates one unresponsive member.
pub fn honest_majority_threshold(group_size: usize) -> usize {
    group_size.saturating_sub(1) / 2
}

/// Keep lifecycle manager.
///
/// Subscribes to keep creation, runs one DKG session per keep this operator
/// belongs to, persists the resulting signer before publishing its public
/// key, and serves signature requests for every keep whose signer is
/// loaded. Failures are isolated per keep: a keep whose share exists
/// off-chain but could not be announced on-chain is marked stuck and left
/// for operator intervention.
pub struct KeepLifecycle {
    chain: Arc<dyn Chain>,
    provider: Arc<dyn Provider>,
    storage: Arc<dyn SignerStorage>,
    pool: Arc<PreParamsPool>,
    this_member: MemberId,
    config: LifecycleConfig,
    signers: Mutex<HashMap<String, Arc<ThresholdSigner>>>,
    active_signing: tokio::sync::Mutex<HashSet<Address>>,
    stuck: Mutex<HashSet<Address>>,
    cancel: CancelToken,
}

impl KeepLifecycle {
    pub fn new(
        chain: Arc<dyn Chain>,
        provider: Arc<dyn Provider>,
        storage: Arc<dyn SignerStorage>,
        config: LifecycleConfig,
        cancel: CancelToken,
    ) -> Arc<Self> {
        let pool = PreParamsPool::new(config.pre_params_generation_timeout);
        let this_member = MemberId::from(chain.operator_address());
        Arc::new(Self {
            chain,
            provider,
            storage,
            pool,
            this_member,
            config,
            signers: Mutex::new(HashMap::new()),
            active_signing: tokio::sync::Mutex::new(HashSet::new()),
            stuck: Mutex::new(HashSet::new()),
            cancel,
        })
    }

    pub fn this_member(&self) -> &MemberId {
        &self.this_member
    }

    /// Re-registers signature handlers for every persisted signer, then
    /// subscribes to keep creation. Call once at operator startup.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        for signer in self.storage.load_all()? {
            let keep_id = signer.group_id().to_string();
            info!(keep = %keep_id, "restoring persisted signer");
            if let Err(err) = self.register_signer(Arc::new(signer)).await {
                error!(keep = %keep_id, %err, "failed to restore persisted signer");
            }
        }

        let weak = Arc::downgrade(self);
        self.chain
            .on_keep_created(Arc::new(move |event| {
                let Some(lifecycle) = weak.upgrade() else { return };
                tokio::spawn(async move { lifecycle.handle_keep_created(event).await });
            }))
            .await
    }

    /// True when the keep's share exists off-chain but the chain has no
    /// usable record of it.
    pub fn is_stuck(&self, keep_address: &Address) -> bool {
        self.stuck.lock().expect("stuck lock").contains(keep_address)
    }

    pub fn signer_for(&self, keep_address: &Address) -> Option<Arc<ThresholdSigner>> {
        self.signers.lock().expect("signers lock").get(&keep_address.to_string()).cloned()
    }

    async fn handle_keep_created(self: Arc<Self>, event: KeepCreatedEvent) {
        if !event.members.contains(&self.this_member) {
            debug!(keep = %event.keep_address, "keep does not include this operator");
            return;
        }

        info!(keep = %event.keep_address, members = event.members.len(), "joining keep");
        if let Err(err) = self.join_keep(&event).await {
            if err.is_cancelled() {
                debug!(keep = %event.keep_address, "keep setup cancelled");
            } else {
                error!(keep = %event.keep_address, %err, "keep setup failed");
            }
        }
    }

    async fn join_keep(self: &Arc<Self>, event: &KeepCreatedEvent) -> Result<()> {
        let dishonest_threshold = self
            .config
            .dishonest_threshold
            .unwrap_or_else(|| honest_majority_threshold(event.members.len()));
        let group = GroupInfo::new(
            event.keep_address.to_string(),
            self.this_member.clone(),
            event.members.clone(),
            dishonest_threshold,
        )?;

        let pre_params = self.pool.take().await?;
        let signer =
            run_keygen(&self.provider, &group, pre_params, &self.config.session, &self.cancel).await?;

        if let Err(err) = self.storage.save(&signer) {
            // The share is not durable; publishing the key would leave the
            // chain pointing at a signer that may not survive a restart.
            self.mark_stuck(event.keep_address);
            error!(keep = %event.keep_address, %err, "failed to persist signer; public key not published");
            return Err(err);
        }

        let public_key = signer.public_key_bytes()?;
        let submission = self
            .submit_with_retry("submit public key", || {
                self.chain.submit_public_key(event.keep_address, public_key)
            })
            .await;
        if let Err(err) = submission {
            self.mark_stuck(event.keep_address);
            error!(
                keep = %event.keep_address,
                %err,
                "public key submission failed permanently; keep requires operator intervention"
            );
            return Err(err);
        }

        self.register_signer(Arc::new(signer)).await
    }

    async fn register_signer(self: &Arc<Self>, signer: Arc<ThresholdSigner>) -> Result<()> {
        let keep_address: Address = signer.group_id().parse()?;
        {
            let mut signers = self.signers.lock().expect("signers lock");
            signers.insert(signer.group_id().to_string(), signer);
        }

        let weak = Arc::downgrade(self);
        self.chain
            .on_signature_requested(
                keep_address,
                Arc::new(move |event| {
                    let Some(lifecycle) = weak.upgrade() else { return };
                    tokio::spawn(async move {
                        lifecycle.handle_signature_requested(keep_address, event).await
                    });
                }),
            )
            .await
    }

    async fn handle_signature_requested(self: Arc<Self>, keep_address: Address, event: SignatureRequestedEvent) {
        if !self.mark_signing_active(keep_address).await {
            debug!(keep = %keep_address, "signing already in progress; duplicate request ignored");
            return;
        }

        let result = self.sign_and_submit(keep_address, event.digest).await;
        self.clear_signing_active(keep_address).await;

        if let Err(err) = result {
            if err.is_cancelled() {
                debug!(keep = %keep_address, "signing cancelled");
            } else {
                error!(keep = %keep_address, %err, "signing failed");
            }
        }
    }

    async fn sign_and_submit(&self, keep_address: Address, digest: Digest32) -> Result<()> {
        let signer = self
            .signer_for(&keep_address)
            .ok_or_else(|| OperatorError::Message(format!("no signer loaded for keep [{}]", keep_address)))?;

        let ledger = PersistedNonceLedger {
            storage: self.storage.clone(),
            signer: signer.clone(),
            reserved: Mutex::new(None),
        };
        let result =
            run_signing(&self.provider, &signer, digest, &self.config.session, &ledger, &self.cancel).await;

        // Reserved presignatures stay spent whether or not the session
        // succeeded.
        if let Some(next_unused) = *ledger.reserved.lock().expect("reserved lock") {
            self.record_presignatures_spent(&keep_address, next_unused);
        }

        let signature = result?;
        info!(
            keep = %keep_address,
            recovery_id = signature.recovery_id,
            "signature calculated"
        );

        let v = signature.recovery_id + 27;
        self.submit_with_retry("submit signature", || {
            self.chain.submit_signature(keep_address, digest, signature.r, signature.s, v)
        })
        .await
    }

    fn record_presignatures_spent(&self, keep_address: &Address, next_unused: u64) {
        let mut signers = self.signers.lock().expect("signers lock");
        if let Some(signer) = signers.get_mut(&keep_address.to_string()) {
            if signer.presignatures_used() < next_unused {
                *signer = Arc::new((**signer).clone().with_presignatures_used(next_unused));
            }
        }
    }

    async fn submit_with_retry<F, Fut>(&self, operation: &str, mut submit: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut backoff = self.config.submit_initial_backoff;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match submit().await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient_chain_error() && attempt < self.config.submit_attempts => {
                    warn!(%err, attempt, operation, "chain submission failed; retrying");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(OperatorError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(SUBMIT_RETRY_MAX_BACKOFF);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn mark_stuck(&self, keep_address: Address) {
        self.stuck.lock().expect("stuck lock").insert(keep_address);
    }

    async fn mark_signing_active(&self, keep_address: Address) -> bool {
        let mut active = self.active_signing.lock().await;
        if active.contains(&keep_address) {
            return false;
        }
        active.insert(keep_address);
        true
    }

    async fn clear_signing_active(&self, keep_address: Address) {
        self.active_signing.lock().await.remove(&keep_address);
    }
}

/// Presignature ledger backed by the signer store: reservations rewrite the
/// keep's signer file, so spent presignatures stay spent across restarts.
struct PersistedNonceLedger {
    storage: Arc<dyn SignerStorage>,
    signer: Arc<ThresholdSigner>,
    reserved: Mutex<Option<u64>>,
}

impl NonceLedger for PersistedNonceLedger {
    fn cursor(&self) -> u64 {
        self.signer.presignatures_used()
    }

    fn reserve(&self, next_unused: u64) -> Result<()> {
        let updated = (*self.signer).clone().with_presignatures_used(next_unused);
        self.storage.save(&updated)?;
        *self.reserved.lock().expect("reserved lock") = Some(next_unused);
        Ok(())
    }
}

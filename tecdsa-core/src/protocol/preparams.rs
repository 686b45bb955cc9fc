use crate::foundation::{OperatorError, Result};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default deadline for pre-parameter generation.
pub const DEFAULT_PRE_PARAMS_GENERATION_TIMEOUT: Duration = Duration::from_secs(90);

/// Per-member pre-computed material required before key generation can run.
///
/// Opaque to everything but the party machines. Generation is treated as
/// expensive and deadline-bounded; a pool may produce entries ahead of
/// protocol execution.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PreParams {
    entropy: [u8; 32],
}

impl PreParams {
    pub(crate) fn entropy(&self) -> &[u8; 32] {
        &self.entropy
    }

    fn generate_blocking() -> Result<PreParams> {
        let mut entropy = [0u8; 32];
        OsRng.fill_bytes(&mut entropy);
        Ok(PreParams { entropy })
    }
}

/// Generates pre-parameters, failing when the deadline expires.
pub async fn generate_pre_params(timeout: Duration) -> Result<PreParams> {
    let generation = tokio::task::spawn_blocking(PreParams::generate_blocking);
    match tokio::time::timeout(timeout, generation).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => {
            Err(OperatorError::protocol("pre-params", format!("generation task failed: {}", join_err)))
        }
        Err(_) => Err(OperatorError::protocol(
            "pre-params",
            format!("failed to generate pre-params: timed out after {:?}", timeout),
        )),
    }
}

use crate::foundation::{OperatorError, Result};
use crate::protocol::{generate_pre_params, PreParams};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const GENERATION_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Pool of pre-generated protocol parameters.
///
/// Holds one ready entry and regenerates in the background as soon as it is
/// consumed; the bounded queue keeps at most one generator running.
/// `take` waits when the pool is empty.
pub struct PreParamsPool {
    receiver: Mutex<mpsc::Receiver<PreParams>>,
    generator: JoinHandle<()>,
}

impl PreParamsPool {
    pub fn new(generation_timeout: Duration) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(1);
        let generator = tokio::spawn(async move {
            loop {
                match generate_pre_params(generation_timeout).await {
                    Ok(params) => {
                        debug!("pre-parameters generated");
                        if tx.send(params).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(%err, "pre-parameters generation failed; retrying");
                        tokio::time::sleep(GENERATION_RETRY_DELAY).await;
                    }
                }
            }
        });
        Arc::new(Self { receiver: Mutex::new(rx), generator })
    }

    pub async fn take(&self) -> Result<PreParams> {
        self.receiver
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| OperatorError::Message("pre-parameters pool shut down".to_string()))
    }
}

impl Drop for PreParamsPool {
    fn drop(&mut self) {
        self.generator.abort();
    }
}

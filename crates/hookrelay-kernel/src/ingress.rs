use std::sync::Arc;
use std::time::Duration;

use hookrelay_protocol::RelayError;
use parking_lot::Mutex;
use subtle::ConstantTimeEq;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::pipeline::IngestPipeline;
use crate::signature;

const SUBSCRIBE: &str = "subscribe";

/// Webhook entry point: answers the verification handshake and authenticates
/// deliveries, then hands them to the pipeline after the caller has its ack.
pub struct WebhookIngress {
    verify_token: String,
    secret: Option<String>,
    pipeline: IngestPipeline,
    tasks: Mutex<JoinSet<()>>,
}

impl WebhookIngress {
    pub fn new(
        verify_token: impl Into<String>,
        secret: Option<String>,
        pipeline: IngestPipeline,
    ) -> Self {
        Self {
            verify_token: verify_token.into(),
            secret,
            pipeline,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn pipeline(&self) -> &IngestPipeline {
        &self.pipeline
    }

    /// Echo `challenge` back when `mode` is `subscribe` and the token matches.
    pub fn handshake(
        &self,
        mode: Option<&str>,
        verify_token: Option<&str>,
        challenge: Option<&str>,
    ) -> Result<String, RelayError> {
        let token_matches = verify_token.is_some_and(|token| {
            bool::from(token.as_bytes().ct_eq(self.verify_token.as_bytes()))
        });
        if mode == Some(SUBSCRIBE) && token_matches {
            info!("webhook verification handshake accepted");
            return Ok(challenge.unwrap_or_default().to_owned());
        }
        warn!(mode = ?mode, "webhook verification handshake rejected");
        Err(RelayError::Authentication(
            "verification token mismatch".to_owned(),
        ))
    }

    /// Authenticate a delivery and schedule its processing.
    ///
    /// Returns as soon as the work is scheduled; nothing downstream runs
    /// before the caller can acknowledge. Must be called inside a tokio
    /// runtime.
    pub fn accept(&self, body: Vec<u8>, signature_header: Option<&str>) -> Result<(), RelayError> {
        if !signature::verify(&body, signature_header, self.secret.as_deref()) {
            warn!(
                signature = if signature_header.is_some() { "invalid" } else { "missing" },
                "rejecting delivery with bad signature"
            );
            return Err(RelayError::Authentication(
                "signature verification failed".to_owned(),
            ));
        }

        let pipeline = self.pipeline.clone();
        let signature_valid = self.secret.is_some();
        let mut tasks = self.tasks.lock();
        reap(&mut tasks);
        tasks.spawn(async move {
            if let Err(error) = pipeline.ingest(&body, signature_valid).await {
                debug!(%error, "delivery dropped after ack");
            }
        });
        Ok(())
    }

    /// Post-ack tasks that have not been reaped yet.
    pub fn in_flight(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Wait up to `grace` for post-ack work, then abort whatever is left.
    /// Returns the number of tasks that finished in time.
    pub async fn drain(&self, grace: Duration) -> usize {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        let mut finished = 0;
        let drained = tokio::time::timeout(grace, async {
            while let Some(result) = tasks.join_next().await {
                log_join(result);
                finished += 1;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                "post-ack work still running after grace period, aborting"
            );
            tasks.abort_all();
        }
        finished
    }
}

fn reap(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.try_join_next() {
        log_join(result);
    }
}

fn log_join(result: Result<(), tokio::task::JoinError>) {
    match result {
        Ok(()) => {}
        Err(join_error) if join_error.is_panic() => {
            error!(%join_error, "post-ack task panicked");
        }
        Err(join_error) => debug!(%join_error, "post-ack task cancelled"),
    }
}

impl Drop for WebhookIngress {
    fn drop(&mut self) {
        let pending = self.tasks.get_mut().len();
        if pending > 0 {
            debug!(pending, "ingress dropped with post-ack work in flight");
        }
    }
}

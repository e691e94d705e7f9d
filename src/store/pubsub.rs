//! Pub/Sub subscriber
//!
//! One pattern subscription per process, multiplexed across every
//! auction room. Messages are forwarded into an in-process channel the
//! gateway fan-out consumes; on connection loss the listener reconnects
//! with exponential backoff and the gateway keeps serving read-through
//! from the store in the meantime.

use futures::StreamExt;
use rand::Rng;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::settings::PubSubRetrySettings;

/// Which channel family a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Events,
    Timer,
    Chat,
}

/// A raw message off the bus; payloads are parsed downstream.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

pub struct PubSubListener {
    client: redis::Client,
    patterns: Vec<String>,
    retry: PubSubRetrySettings,
    tx: mpsc::Sender<BusMessage>,
}

impl PubSubListener {
    pub fn new(
        client: redis::Client,
        patterns: Vec<String>,
        retry: PubSubRetrySettings,
        tx: mpsc::Sender<BusMessage>,
    ) -> Self {
        Self {
            client,
            patterns,
            retry,
            tx,
        }
    }

    /// Run until cancelled or the retry budget is exhausted.
    pub async fn run(self, cancel: CancellationToken) {
        let mut attempt: u32 = 0;

        while !cancel.is_cancelled() {
            attempt += 1;
            match self.listen_once(&cancel).await {
                Ok(()) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    warn!("pub/sub connection closed unexpectedly, reconnecting");
                    // A healthy session earns a fresh retry budget.
                    attempt = 1;
                }
                Err(err) => {
                    error!(
                        attempt,
                        max_attempts = self.retry.retry_max_attempts,
                        error = %err,
                        "pub/sub connection failed"
                    );
                    if attempt >= self.retry.retry_max_attempts {
                        error!("pub/sub retry budget exhausted, listener stopping");
                        return;
                    }
                }
            }

            let delay = backoff_delay(&self.retry, attempt);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!("pub/sub listener stopped");
    }

    async fn listen_once(&self, cancel: &CancellationToken) -> Result<(), redis::RedisError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for pattern in &self.patterns {
            pubsub.psubscribe(pattern).await?;
        }
        info!(patterns = ?self.patterns, "subscribed to pub/sub channels");

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                message = stream.next() => {
                    let Some(message) = message else {
                        // Stream closed: connection dropped.
                        return Ok(());
                    };
                    let channel = message.get_channel_name().to_string();
                    let payload: String = match message.get_payload() {
                        Ok(payload) => payload,
                        Err(err) => {
                            warn!(channel, error = %err, "undecodable pub/sub payload");
                            continue;
                        }
                    };
                    if self.tx.send(BusMessage { channel, payload }).await.is_err() {
                        // Fan-out consumer is gone; nothing left to serve.
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Exponential backoff with a randomized jitter, capped at the
/// configured maximum.
fn backoff_delay(retry: &PubSubRetrySettings, attempt: u32) -> Duration {
    let base = retry.retry_initial_delay_seconds as f64
        * retry.retry_multiplier.powi(attempt.saturating_sub(1) as i32);
    let capped = base.min(retry.retry_max_delay_seconds as f64);
    let jitter = rand::thread_rng().gen_range(0.0..0.25) * capped;
    Duration::from_secs_f64(capped + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry() -> PubSubRetrySettings {
        PubSubRetrySettings {
            retry_max_attempts: 10,
            retry_initial_delay_seconds: 2,
            retry_max_delay_seconds: 60,
            retry_multiplier: 2.0,
        }
    }

    #[test]
    fn backoff_grows_exponentially_then_caps() {
        let retry = retry();
        let first = backoff_delay(&retry, 1);
        assert!(first >= Duration::from_secs(2) && first < Duration::from_secs(3));

        let third = backoff_delay(&retry, 3);
        assert!(third >= Duration::from_secs(8) && third < Duration::from_secs(11));

        // 2 * 2^9 = 1024s, capped at 60 plus jitter.
        let tenth = backoff_delay(&retry, 10);
        assert!(tenth >= Duration::from_secs(60) && tenth <= Duration::from_secs(75));
    }
}

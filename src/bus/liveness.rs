//! Ping/pong liveness protocol.
//!
//! Every bus answers pings on its namespace, its own included. A ping
//! therefore always collects one pong from the caller; `min_response_count`
//! counts only the other peers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::Bus;
use crate::broker::{MessageHandler, SubscriptionId};
use crate::error::Result;
use crate::naming::{PING_EVENT, PONG_EVENT};

/// Default time to wait for pongs.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_millis(3000);

/// Default number of other peers that must answer.
pub const DEFAULT_MIN_RESPONSE_COUNT: usize = 1;

/// Parameters for a single ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingOptions {
    pub timeout: Duration,
    /// Peers other than the caller that must answer.
    pub min_response_count: usize,
}

impl Default for PingOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PING_TIMEOUT,
            min_response_count: DEFAULT_MIN_RESPONSE_COUNT,
        }
    }
}

impl PingOptions {
    /// Pongs needed to succeed, counting the caller's own answer.
    pub fn required_responses(&self) -> usize {
        self.min_response_count + 1
    }
}

impl Bus {
    /// Ping with default options.
    pub async fn ping(&self) -> Result<bool> {
        self.ping_with(PingOptions::default()).await
    }

    /// Broadcast a ping and wait for enough pongs.
    ///
    /// Resolves `Ok(true)` as soon as `min_response_count` other peers (plus
    /// this bus) have answered, `Ok(false)` once the timeout elapses first.
    /// The deadline is armed before the pong listener is installed and also
    /// bounds that subscription. The temporary pong listener is removed on
    /// every path.
    pub async fn ping_with(&self, options: PingOptions) -> Result<bool> {
        let deadline = Instant::now() + options.timeout;
        let required = options.required_responses();
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let counter: Arc<dyn MessageHandler> = Arc::new(move |_payload: String| {
            let _ = tx.send(());
        });

        let subscribed = tokio::time::timeout_at(deadline, self.listen(PONG_EVENT, counter)).await;
        let listener = match subscribed {
            Ok(listener) => listener?,
            Err(_) => {
                debug!(bus = %self.name, "Ping timed out before pong listener was ready");
                return Ok(false);
            }
        };

        if let Err(e) = self.publish(PING_EVENT, String::new()) {
            self.release_pong_listener(listener).await;
            return Err(e);
        }

        let mut responses = 0usize;
        let collected = tokio::time::timeout_at(deadline, async {
            while rx.recv().await.is_some() {
                responses += 1;
                if responses >= required {
                    return;
                }
            }
        })
        .await;

        self.release_pong_listener(listener).await;

        let alive = collected.is_ok() && responses >= required;
        debug!(
            bus = %self.name,
            responses,
            required,
            alive,
            "Ping resolved"
        );
        Ok(alive)
    }

    async fn release_pong_listener(&self, listener: SubscriptionId) {
        if let Err(e) = self.unlisten(PONG_EVENT, listener).await {
            warn!(bus = %self.name, error = %e, "Failed to remove pong listener");
        }
    }
}

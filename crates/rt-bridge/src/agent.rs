//! The bridge agent: composition root and main loop
//!
//! Owns the relay link, the session table (through [`BridgeState`]), the
//! auth gate and the dispatcher. `run` keeps the link up with exponential
//! backoff until the shutdown token fires; sessions survive relay outages
//! and simply stop producing visible output while the link is down.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use rt_core::config::BridgeConfig;
use rt_core::{BridgeError, FrameSink, LinkError};

use crate::dispatcher::Dispatcher;
use crate::relay::{ExponentialBackoff, Inbound, LinkSettings, RelayLink};
use crate::state::BridgeState;

/// How a connected period ended
#[derive(Debug)]
enum Served {
    /// Shutdown was requested
    Shutdown,
    /// The relay closed the connection cleanly
    RemoteClosed,
    /// Transport failure or idle timeout
    Failed(LinkError),
}

/// Device-resident bridge between local shells and the relay
pub struct BridgeAgent {
    state: Arc<BridgeState>,
    link: Arc<RelayLink>,
    dispatcher: Dispatcher,
    cancel: CancellationToken,
}

impl BridgeAgent {
    /// Build the agent from a resolved configuration
    pub fn new(config: BridgeConfig, shutdown: CancellationToken) -> Result<Self, BridgeError> {
        let state = BridgeState::new(config, shutdown.clone())?;
        Ok(Self::from_state(Arc::new(state), shutdown))
    }

    /// Build the agent around existing state
    pub fn from_state(state: Arc<BridgeState>, shutdown: CancellationToken) -> Self {
        let link = Arc::new(RelayLink::new(
            LinkSettings::from_config(&state.config),
            state.identity.clone(),
        ));
        let sink: Arc<dyn FrameSink> = link.clone();
        let dispatcher = Dispatcher::new(state.clone(), sink);

        Self {
            state,
            link,
            dispatcher,
            cancel: shutdown,
        }
    }

    pub fn state(&self) -> &Arc<BridgeState> {
        &self.state
    }

    pub fn link(&self) -> &Arc<RelayLink> {
        &self.link
    }

    /// Run until the shutdown token is cancelled, then close everything
    pub async fn run(&self) {
        let mut backoff = ExponentialBackoff::from_config(&self.state.config.backoff);

        while !self.cancel.is_cancelled() {
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.link.connect() => result,
            };

            match connected {
                Ok(inbound) => {
                    backoff.reset();
                    match self.serve(inbound).await {
                        Served::Shutdown => break,
                        Served::RemoteClosed => {
                            tracing::info!("Relay closed the connection");
                        }
                        Served::Failed(e) => {
                            tracing::warn!("Relay connection lost: {}", e);
                        }
                    }
                    self.link.disconnect();
                }
                Err(LinkError::Closed) => break,
                Err(e) => {
                    tracing::warn!("{}", e);
                }
            }

            let delay = backoff.next_delay();
            tracing::info!("Reconnecting to relay in {:?}", delay);

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.shutdown().await;
    }

    /// Route inbound frames for one connected period
    ///
    /// Frames are handled one at a time, so input for a session is applied
    /// in the order it arrived.
    async fn serve(&self, mut inbound: Inbound) -> Served {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Served::Shutdown,
                next = inbound.next() => next,
            };

            match next {
                Some(Ok(text)) => self.dispatcher.dispatch_text(&text).await,
                Some(Err(e)) => return Served::Failed(e),
                None => return Served::RemoteClosed,
            }
        }
    }

    /// Stop accepting work, close all sessions, then close the link
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down bridge");
        self.link.mark_closing();
        self.state.close_all().await;
        self.link.close().await;
    }
}

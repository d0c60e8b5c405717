use crate::error::{DiscoveryError, Result};
use crate::state::DiscoveryState;
use tokio::sync::broadcast;

/// Receiver for discovery state snapshots
///
/// Obtained from [`Coordinator::subscribe_state`](crate::Coordinator::subscribe_state).
/// A slow receiver skips snapshots rather than holding the run back.
pub struct StateReceiver {
    rx: broadcast::Receiver<DiscoveryState>,
}

impl StateReceiver {
    pub(crate) fn new(rx: broadcast::Receiver<DiscoveryState>) -> Self {
        Self { rx }
    }

    /// Receive the next snapshot
    ///
    /// If the receiver fell behind, the missed snapshots are skipped and the
    /// oldest one still buffered is returned. Fails once the coordinator is gone.
    pub async fn recv(&mut self) -> Result<DiscoveryState> {
        loop {
            match self.rx.recv().await {
                Ok(state) => return Ok(state),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("State receiver lagged by {} snapshots", n);
                }
                Err(broadcast::error::RecvError::Closed) => return Err(DiscoveryError::ShutDown),
            }
        }
    }

    /// Try to receive a snapshot without waiting
    ///
    /// Returns `None` if no snapshot is available.
    pub fn try_recv(&mut self) -> Result<Option<DiscoveryState>> {
        loop {
            match self.rx.try_recv() {
                Ok(state) => return Ok(Some(state)),
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::debug!("State receiver lagged by {} snapshots", n);
                }
                Err(broadcast::error::TryRecvError::Closed) => {
                    return Err(DiscoveryError::ShutDown)
                }
            }
        }
    }
}

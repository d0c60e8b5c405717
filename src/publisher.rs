use crate::error::Result;
use crate::protocol::{ResultPayload, StatusPayload};
use crate::state::{DiscoveryState, DiscoveryStatus};
use async_trait::async_trait;
use std::sync::Arc;

/// Message bus the discovery state is published to (e.g. an MQTT client)
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publish a payload; best effort
    async fn publish(&self, destination: &str, payload: Vec<u8>, retain: bool) -> Result<()>;
}

/// Callback registered with [`Coordinator::register_publisher`](crate::Coordinator::register_publisher)
///
/// Invoked with every state snapshot. Errors are logged and otherwise ignored.
#[async_trait]
pub trait StatePublisher: Send + Sync {
    async fn publish_state(&self, state: &DiscoveryState) -> Result<()>;
}

#[async_trait]
impl<F> StatePublisher for F
where
    F: Fn(&DiscoveryState) -> Result<()> + Send + Sync,
{
    async fn publish_state(&self, state: &DiscoveryState) -> Result<()> {
        self(state)
    }
}

/// Topic names under a base topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryTopics {
    pub status: String,
    pub result: String,
    pub control: String,
}

impl DiscoveryTopics {
    pub fn new(base_topic: &str) -> Self {
        let base = base_topic.trim_end_matches('/');
        Self {
            status: format!("{}/discovery/status", base),
            result: format!("{}/discovery/result", base),
            control: format!("{}/discovery/control", base),
        }
    }
}

/// Publishes state snapshots as JSON onto a [`MessagePublisher`]
///
/// Every snapshot goes to the status topic (not retained). Completed
/// results additionally go to the result topic, retained, so late
/// subscribers still find the last findings.
pub struct BusStatePublisher {
    publisher: Arc<dyn MessagePublisher>,
    topics: DiscoveryTopics,
}

impl BusStatePublisher {
    pub fn new(publisher: Arc<dyn MessagePublisher>, base_topic: &str) -> Self {
        Self {
            publisher,
            topics: DiscoveryTopics::new(base_topic),
        }
    }

    pub fn topics(&self) -> &DiscoveryTopics {
        &self.topics
    }
}

#[async_trait]
impl StatePublisher for BusStatePublisher {
    async fn publish_state(&self, state: &DiscoveryState) -> Result<()> {
        let status = serde_json::to_vec(&StatusPayload::from_state(state))?;
        self.publisher
            .publish(&self.topics.status, status, false)
            .await?;

        if state.status == DiscoveryStatus::Completed {
            if let Some(results) = &state.results {
                let payload = serde_json::to_vec(&ResultPayload::from_results(results, state))?;
                self.publisher
                    .publish(&self.topics.result, payload, true)
                    .await?;
                tracing::info!("Published discovery results to {}", self.topics.result);
            }
        }

        Ok(())
    }
}

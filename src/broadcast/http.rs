use async_trait::async_trait;
use std::sync::Arc;

use super::Broadcaster;
use super::types::{BroadcastReport, ClusterEvent, EventEnvelope};
use crate::cluster::state::ClusterState;
use crate::config::{HttpConfig, MembershipKind};
use crate::error::BroadcastError;
use crate::membership::types::Node;
use crate::net::{post_with_retry, url};
use crate::protocol::ENDPOINT_MESSAGE;

/// Posts every event to every other node of the current topology in parallel.
#[derive(Clone)]
pub struct HttpBroadcaster {
    state: Arc<ClusterState>,
    http_client: reqwest::Client,
    config: HttpConfig,
}

impl HttpBroadcaster {
    pub fn new(state: Arc<ClusterState>, config: HttpConfig) -> Self {
        Self {
            state,
            http_client: reqwest::Client::new(),
            config,
        }
    }

    fn recipients(&self) -> Vec<Node> {
        let local = self.state.local();
        self.state
            .topology()
            .nodes
            .iter()
            .filter(|node| *node != local)
            .cloned()
            .collect()
    }

    async fn deliver(&self, node: &Node, body: &serde_json::Value) -> bool {
        match post_with_retry(
            &self.http_client,
            &url(&node.host, ENDPOINT_MESSAGE),
            body,
            self.config.timeout(),
            self.config.retries,
        )
        .await
        {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                tracing::warn!("{} refused event: {}", node, resp.status());
                false
            }
            Err(e) => {
                tracing::warn!("Failed to deliver event to {}: {}", node, e);
                false
            }
        }
    }

    async fn fan_out(&self, envelope: EventEnvelope) -> Result<BroadcastReport, BroadcastError> {
        let body = serde_json::to_value(&envelope)?;
        let recipients = self.recipients();

        let outcomes = futures::future::join_all(
            recipients.iter().map(|node| self.deliver(node, &body)),
        )
        .await;

        let mut report = BroadcastReport::default();
        for (node, delivered) in recipients.into_iter().zip(outcomes) {
            if delivered {
                report.reached.push(node);
            } else {
                report.unreached.push(node);
            }
        }

        tracing::debug!(
            "Broadcast {} reached {}/{} node(s)",
            envelope.event.kind(),
            report.reached.len(),
            report.reached.len() + report.unreached.len()
        );
        Ok(report)
    }
}

#[async_trait]
impl Broadcaster for HttpBroadcaster {
    async fn send(&self, event: ClusterEvent) -> Result<(), BroadcastError> {
        let envelope = EventEnvelope::new(self.state.local().host.clone(), event);
        let broadcaster = self.clone();

        tokio::spawn(async move {
            let kind = envelope.event.kind();
            match broadcaster.fan_out(envelope).await {
                Ok(report) if !report.is_complete() => {
                    tracing::warn!(
                        "{} event missed {} node(s): {:?}",
                        kind,
                        report.unreached.len(),
                        report.unreached
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!("Broadcast of {} failed: {}", kind, e),
            }
        });

        Ok(())
    }

    async fn send_sync(&self, event: ClusterEvent) -> Result<BroadcastReport, BroadcastError> {
        let envelope = EventEnvelope::new(self.state.local().host.clone(), event);
        self.fan_out(envelope).await
    }

    fn kind(&self) -> MembershipKind {
        MembershipKind::Http
    }
}

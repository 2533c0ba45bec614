//! Capability announcements on the discovery channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use trellis_bus::{BusAdapter, CAPABILITY_ANNOUNCEMENTS};

/// One advertised operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationSpec {
    /// Operation name.
    pub name: String,

    /// Short description.
    pub description: String,

    /// Whether resubmitting the operation is safe.
    pub retry_safe: bool,

    /// Rough duration estimate shown to planners.
    pub estimated_duration: String,
}

/// Announcement document published on the discovery channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityAnnouncement {
    /// Announcing service name.
    pub service: String,

    /// Service version.
    pub version: String,

    /// Advertised operations.
    pub operations: Vec<OperationSpec>,

    /// Announcement time.
    pub timestamp: DateTime<Utc>,
}

/// The orchestrator's operation catalog.
pub fn operation_catalog() -> Vec<OperationSpec> {
    vec![
        OperationSpec {
            name: "execute_workflow".to_string(),
            description: "Render a workflow template and execute its task graph".to_string(),
            retry_safe: false,
            estimated_duration: "1m".to_string(),
        },
        OperationSpec {
            name: "generate_ai_workflow".to_string(),
            description: "Generate a workflow definition from a brief and execute it".to_string(),
            retry_safe: false,
            estimated_duration: "2m".to_string(),
        },
        OperationSpec {
            name: "get_execution_status".to_string(),
            description: "Report the current state of an execution".to_string(),
            retry_safe: true,
            estimated_duration: "1s".to_string(),
        },
        OperationSpec {
            name: "cancel_workflow".to_string(),
            description: "Cancel a live execution".to_string(),
            retry_safe: true,
            estimated_duration: "5s".to_string(),
        },
        OperationSpec {
            name: "list_templates".to_string(),
            description: "List the available workflow templates".to_string(),
            retry_safe: true,
            estimated_duration: "1s".to_string(),
        },
    ]
}

/// Builds the current announcement document.
pub fn announcement() -> CapabilityAnnouncement {
    CapabilityAnnouncement {
        service: "trellis-orchestrator".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        operations: operation_catalog(),
        timestamp: Utc::now(),
    }
}

/// Spawns the periodic announcer. The catalog is published once
/// immediately and then on every interval tick.
pub fn spawn_announcer(
    bus: Arc<dyn BusAdapter>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let payload = match serde_json::to_vec(&announcement()) {
                        Ok(payload) => payload,
                        Err(err) => {
                            warn!("Capability announcement encoding failed: {}", err);
                            continue;
                        }
                    };
                    if let Err(err) = bus.publish(CAPABILITY_ANNOUNCEMENTS, payload).await {
                        warn!("Capability announcement publish failed: {}", err);
                    } else {
                        debug!("Published capability announcement");
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("Capability announcer stopped");
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_bus::InMemoryBus;

    #[test]
    fn test_catalog_names_every_operation() {
        let names: Vec<String> = operation_catalog()
            .into_iter()
            .map(|op| op.name)
            .collect();
        assert_eq!(
            names,
            vec![
                "execute_workflow",
                "generate_ai_workflow",
                "get_execution_status",
                "cancel_workflow",
                "list_templates",
            ]
        );
    }

    #[tokio::test]
    async fn test_announcer_publishes_on_interval() {
        let bus = Arc::new(InMemoryBus::new());
        let mut announcements = bus.subscribe(CAPABILITY_ANNOUNCEMENTS).await.unwrap();

        let shutdown = CancellationToken::new();
        let announcer = spawn_announcer(
            bus.clone(),
            Duration::from_millis(10),
            shutdown.clone(),
        );

        let payload = announcements.next().await.unwrap();
        let decoded: CapabilityAnnouncement = serde_json::from_slice(&payload).unwrap();
        assert_eq!(decoded.service, "trellis-orchestrator");
        assert_eq!(decoded.operations.len(), 5);

        shutdown.cancel();
        announcer.await.unwrap();
    }
}

//! Correlation layer mapping outbound service calls to pending awaiters.

use crate::adapter::BusAdapter;
use crate::error::{BusError, BusResult};
use crate::protocol::{ServiceRequest, ServiceResponse, ServiceRoute};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

type PendingCalls = Arc<DashMap<String, oneshot::Sender<ServiceResponse>>>;

/// Pending-call table keyed by correlation ID.
///
/// Invariants: at most one awaiter exists per correlation ID, the awaiter
/// is removed before [`CorrelationTable::call`] returns on every path, and
/// each ID receives at most one response. Late or duplicate responses find
/// no awaiter and are dropped.
pub struct CorrelationTable {
    bus: Arc<dyn BusAdapter>,
    pending: PendingCalls,
}

impl CorrelationTable {
    /// Creates a correlation table over a bus adapter.
    pub fn new(bus: Arc<dyn BusAdapter>) -> Self {
        Self {
            bus,
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Issues a correlated request and awaits the matching response.
    ///
    /// Generates a correlation ID when the request carries none. Returns
    /// when the response arrives, the timeout elapses, or cancellation is
    /// signalled, removing the awaiter in all cases.
    pub async fn call(
        &self,
        route: ServiceRoute,
        mut request: ServiceRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> BusResult<ServiceResponse> {
        if request.correlation_id.is_empty() {
            request.correlation_id = Uuid::new_v4().to_string();
        }
        let correlation_id = request.correlation_id.clone();
        let payload = serde_json::to_vec(&request)?;

        let (tx, rx) = oneshot::channel();
        if self.pending.insert(correlation_id.clone(), tx).is_some() {
            warn!("Replaced pending awaiter for correlation id {}", correlation_id);
        }

        let outcome = self.await_response(route, payload, rx, timeout, cancel).await;
        self.pending.remove(&correlation_id);
        outcome
    }

    async fn await_response(
        &self,
        route: ServiceRoute,
        payload: Vec<u8>,
        rx: oneshot::Receiver<ServiceResponse>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> BusResult<ServiceResponse> {
        self.bus.publish(route.request, payload).await?;

        tokio::select! {
            response = rx => {
                response.map_err(|_| BusError::ChannelClosed(route.response.to_string()))
            }
            _ = tokio::time::sleep(timeout) => {
                Err(BusError::Timeout {
                    channel: route.request.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            _ = cancel.cancelled() => {
                Err(BusError::Cancelled(route.request.to_string()))
            }
        }
    }

    /// Spawns the background reader for one response channel.
    ///
    /// The pump decodes each payload, extracts the correlation ID and
    /// delivers the response to its awaiter; unknown IDs are logged and
    /// dropped.
    pub async fn start_response_pump(&self, channel: &str) -> BusResult<JoinHandle<()>> {
        let mut subscription = self.bus.subscribe(channel).await?;
        let pending = Arc::clone(&self.pending);
        let channel = channel.to_string();

        Ok(tokio::spawn(async move {
            while let Some(payload) = subscription.next().await {
                deliver(&pending, &channel, &payload);
            }
            debug!("Response pump for '{}' stopped", channel);
        }))
    }

    /// Number of calls currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Routes one raw response payload to its awaiter.
fn deliver(pending: &PendingCalls, channel: &str, payload: &[u8]) {
    let response: ServiceResponse = match serde_json::from_slice(payload) {
        Ok(response) => response,
        Err(err) => {
            warn!("Dropping undecodable payload on '{}': {}", channel, err);
            return;
        }
    };

    match pending.remove(&response.correlation_id) {
        Some((id, tx)) => {
            if tx.send(response).is_err() {
                debug!("Awaiter for correlation id {} gone before delivery", id);
            }
        }
        None => {
            debug!(
                "Dropping response with unknown correlation id {} on '{}'",
                response.correlation_id, channel
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::InMemoryBus;
    use crate::protocol::DATA_ROUTE;
    use std::collections::HashMap;

    fn request(correlation_id: &str) -> ServiceRequest {
        ServiceRequest {
            correlation_id: correlation_id.to_string(),
            operation: "traverse".to_string(),
            parameters: HashMap::new(),
            timeout_secs: None,
        }
    }

    /// Echo service: answers every data request with `success=true`.
    async fn spawn_echo_service(bus: Arc<InMemoryBus>) {
        let mut requests = bus.subscribe(DATA_ROUTE.request).await.unwrap();
        tokio::spawn(async move {
            while let Some(payload) = requests.next().await {
                let request: ServiceRequest = serde_json::from_slice(&payload).unwrap();
                let mut data = HashMap::new();
                data.insert("echo".to_string(), serde_json::json!(request.operation));
                let response = ServiceResponse::ok(request.correlation_id, data);
                bus.publish(DATA_ROUTE.response, serde_json::to_vec(&response).unwrap())
                    .await
                    .unwrap();
            }
        });
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let bus = Arc::new(InMemoryBus::new());
        let table = Arc::new(CorrelationTable::new(bus.clone()));
        table.start_response_pump(DATA_ROUTE.response).await.unwrap();
        spawn_echo_service(bus).await;

        let response = table
            .call(
                DATA_ROUTE,
                request("c1-a"),
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(response.success);
        assert_eq!(response.correlation_id, "c1-a");
        assert_eq!(response.data["echo"], serde_json::json!("traverse"));
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_call_generates_correlation_id() {
        let bus = Arc::new(InMemoryBus::new());
        let table = Arc::new(CorrelationTable::new(bus.clone()));
        table.start_response_pump(DATA_ROUTE.response).await.unwrap();
        spawn_echo_service(bus).await;

        let response = table
            .call(
                DATA_ROUTE,
                request(""),
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!response.correlation_id.is_empty());
    }

    #[tokio::test]
    async fn test_call_timeout_removes_awaiter() {
        let bus = Arc::new(InMemoryBus::new());
        let table = Arc::new(CorrelationTable::new(bus));

        let result = table
            .call(
                DATA_ROUTE,
                request("c1-a"),
                Duration::from_millis(20),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(BusError::Timeout { .. })));
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_call_cancellation_removes_awaiter() {
        let bus = Arc::new(InMemoryBus::new());
        let table = Arc::new(CorrelationTable::new(bus));
        let cancel = CancellationToken::new();

        let call = table.call(
            DATA_ROUTE,
            request("c1-a"),
            Duration::from_secs(5),
            &cancel,
        );
        cancel.cancel();

        let result = call.await;
        assert!(matches!(result, Err(BusError::Cancelled(_))));
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_correlation_id_is_dropped() {
        let bus = Arc::new(InMemoryBus::new());
        let table = Arc::new(CorrelationTable::new(bus.clone()));
        table.start_response_pump(DATA_ROUTE.response).await.unwrap();

        let stray = ServiceResponse::ok("nobody-waits", HashMap::new());
        bus.publish(DATA_ROUTE.response, serde_json::to_vec(&stray).unwrap())
            .await
            .unwrap();

        // Undecodable payloads are dropped as well.
        bus.publish(DATA_ROUTE.response, b"not json".to_vec())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_late_response_after_timeout_is_dropped() {
        let bus = Arc::new(InMemoryBus::new());
        let table = Arc::new(CorrelationTable::new(bus.clone()));
        table.start_response_pump(DATA_ROUTE.response).await.unwrap();

        let result = table
            .call(
                DATA_ROUTE,
                request("c1-late"),
                Duration::from_millis(10),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(BusError::Timeout { .. })));

        let late = ServiceResponse::ok("c1-late", HashMap::new());
        bus.publish(DATA_ROUTE.response, serde_json::to_vec(&late).unwrap())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(table.pending_count(), 0);
    }
}

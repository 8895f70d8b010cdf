use std::sync::Arc;

use hookrelay_dispatch::{FanOutDispatcher, decode};
use hookrelay_events::{DispatchHistory, EventHistory};
use hookrelay_protocol::{DispatchReport, EventId, InboundEvent, RelayError};
use serde_json::Value;
use tracing::{info, instrument, warn};

/// Parse, record, and fan out one authenticated delivery.
#[derive(Clone)]
pub struct IngestPipeline {
    events: Arc<EventHistory>,
    dispatches: Arc<DispatchHistory>,
    dispatcher: FanOutDispatcher,
}

impl IngestPipeline {
    pub fn new(
        events: Arc<EventHistory>,
        dispatches: Arc<DispatchHistory>,
        dispatcher: FanOutDispatcher,
    ) -> Self {
        Self {
            events,
            dispatches,
            dispatcher,
        }
    }

    pub fn events(&self) -> &Arc<EventHistory> {
        &self.events
    }

    pub fn dispatches(&self) -> &Arc<DispatchHistory> {
        &self.dispatches
    }

    pub fn dispatcher(&self) -> &FanOutDispatcher {
        &self.dispatcher
    }

    /// A body that is not JSON is dropped without touching the histories.
    #[instrument(skip(self, body), fields(bytes = body.len()))]
    pub async fn ingest(
        &self,
        body: &[u8],
        signature_valid: bool,
    ) -> Result<Arc<DispatchReport>, RelayError> {
        let payload: Value = serde_json::from_slice(body).map_err(|error| {
            warn!(%error, "dropping delivery that is not valid json");
            RelayError::Parse(error.to_string())
        })?;

        let id = EventId::new_uuid();
        let classified = decode(&id, &payload);
        let event = self.events.append(InboundEvent::with_id(
            id,
            payload,
            classified.kind(),
            signature_valid,
        ));
        info!(event_id = %event.id, kind = %event.kind, "event recorded");

        let report = self.dispatcher.dispatch(&event, &classified).await;
        Ok(self.dispatches.append(report))
    }
}

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::FutureExt;
use futures_util::future::join_all;
use hookrelay_protocol::{
    DispatchReport, InboundEvent, MessageEvent, Sink, SinkCallRecord, SinkError, SinkHandler,
    SinkOutcome, StatusEvent, TemplateUpdate, duration_ms,
};
use tracing::{debug, info, instrument, warn};

use crate::envelope::ClassifiedPayload;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Upper bound for a single sink call. `None` leaves it to the sink.
    pub sink_timeout: Option<Duration>,
    /// Calls slower than this are logged at warn.
    pub slow_call_threshold: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            sink_timeout: None,
            slow_call_threshold: Duration::from_secs(5),
        }
    }
}

/// Delivers classified events to every configured sink.
///
/// Sinks for one entry run concurrently and are isolated from each other:
/// an error, timeout or panic in one sink is recorded and never reaches its
/// siblings. Entries of a batch are processed one after another in arrival
/// order.
#[derive(Clone)]
pub struct FanOutDispatcher {
    sinks: Arc<Vec<Arc<dyn Sink>>>,
    config: DispatcherConfig,
}

impl Default for FanOutDispatcher {
    fn default() -> Self {
        Self::new(Vec::new(), DispatcherConfig::default())
    }
}

#[derive(Clone, Copy)]
enum Target<'a> {
    Message(&'a MessageEvent),
    Status(&'a StatusEvent),
    TemplateStatus(&'a TemplateUpdate),
    TemplateQuality(&'a TemplateUpdate),
}

impl Target<'_> {
    fn handler(&self) -> SinkHandler {
        match self {
            Self::Message(_) => SinkHandler::Message,
            Self::Status(_) => SinkHandler::Status,
            Self::TemplateStatus(_) => SinkHandler::TemplateStatus,
            Self::TemplateQuality(_) => SinkHandler::TemplateQuality,
        }
    }
}

impl FanOutDispatcher {
    pub fn new(sinks: Vec<Arc<dyn Sink>>, config: DispatcherConfig) -> Self {
        Self {
            sinks: Arc::new(sinks),
            config,
        }
    }

    pub fn with_sink(self, sink: Arc<dyn Sink>) -> Self {
        let mut sinks: Vec<Arc<dyn Sink>> = self.sinks.iter().cloned().collect();
        sinks.push(sink);
        Self {
            sinks: Arc::new(sinks),
            config: self.config,
        }
    }

    pub fn sink_names(&self) -> Vec<String> {
        self.sinks.iter().map(|sink| sink.name().to_owned()).collect()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Fan `payload` out to every sink and report what each call did.
    ///
    /// Never fails: sink failures are recorded in the report.
    #[instrument(skip(self, event, payload), fields(event_id = %event.id, kind = %event.kind))]
    pub async fn dispatch(&self, event: &InboundEvent, payload: &ClassifiedPayload) -> DispatchReport {
        let started_at = Utc::now();
        let mut calls = Vec::new();

        match payload {
            ClassifiedPayload::Messages {
                messages, statuses, ..
            } => {
                for message in messages {
                    calls.extend(self.fan_out(Target::Message(message)).await);
                }
                for status in statuses {
                    calls.extend(self.fan_out(Target::Status(status)).await);
                }
            }
            ClassifiedPayload::Statuses { statuses, .. } => {
                for status in statuses {
                    calls.extend(self.fan_out(Target::Status(status)).await);
                }
            }
            ClassifiedPayload::TemplateStatus(update) => {
                calls.extend(self.fan_out(Target::TemplateStatus(update)).await);
            }
            ClassifiedPayload::TemplateQuality(update) => {
                calls.extend(self.fan_out(Target::TemplateQuality(update)).await);
            }
            ClassifiedPayload::Unclassified { field } => {
                info!(field = ?field, "unclassified event, nothing to dispatch");
            }
        }

        let report = DispatchReport {
            event_id: event.id.clone(),
            kind: event.kind,
            started_at,
            finished_at: Utc::now(),
            calls,
            skipped_entries: payload.skipped(),
        };
        debug!(
            calls = report.calls.len(),
            failed = report.failed_calls(),
            skipped = report.skipped_entries,
            "dispatch finished"
        );
        report
    }

    async fn fan_out(&self, target: Target<'_>) -> Vec<SinkCallRecord> {
        join_all(
            self.sinks
                .iter()
                .map(|sink| self.call_sink(sink.as_ref(), target)),
        )
        .await
    }

    async fn call_sink(&self, sink: &dyn Sink, target: Target<'_>) -> SinkCallRecord {
        let handler = target.handler();
        let started = Instant::now();
        let call = async {
            match target {
                Target::Message(event) => sink.on_message(event).await,
                Target::Status(event) => sink.on_status(event).await,
                Target::TemplateStatus(update) => sink.on_template_status(update).await,
                Target::TemplateQuality(update) => sink.on_template_quality(update).await,
            }
        };
        let outcome = self.guarded(sink.name(), call).await;
        let elapsed = started.elapsed();
        let elapsed_ms = duration_ms(elapsed);

        if elapsed >= self.config.slow_call_threshold {
            warn!(
                sink = sink.name(),
                %handler,
                elapsed_ms,
                "slow sink call"
            );
        }

        let (success, detail) = match outcome {
            Ok(outcome) => {
                if !outcome.success {
                    warn!(sink = sink.name(), %handler, detail = %outcome.detail, "sink rejected event");
                }
                (outcome.success, outcome.detail)
            }
            Err(error) => {
                warn!(sink = sink.name(), %handler, %error, "sink call failed");
                (false, error.to_string())
            }
        };

        SinkCallRecord {
            sink: sink.name().to_owned(),
            handler,
            success,
            detail,
            duration_ms: elapsed_ms,
        }
    }

    async fn guarded(
        &self,
        sink: &str,
        call: impl Future<Output = Result<SinkOutcome, SinkError>>,
    ) -> Result<SinkOutcome, SinkError> {
        let caught = AssertUnwindSafe(call).catch_unwind();
        let outcome = match self.config.sink_timeout {
            Some(limit) => match tokio::time::timeout(limit, caught).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(SinkError::Timeout {
                        sink: sink.to_owned(),
                        timeout_ms: duration_ms(limit),
                    });
                }
            },
            None => caught.await,
        };
        outcome.unwrap_or_else(|panic| {
            let message = panic
                .downcast_ref::<&str>()
                .map(|message| (*message).to_owned())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_owned());
            Err(SinkError::Panicked {
                sink: sink.to_owned(),
                message,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use hookrelay_protocol::{
        EventId, InboundEvent, MessageEvent, Sink, SinkError, SinkHandler, SinkOutcome,
        StatusEvent, TemplateUpdate,
    };
    use parking_lot::Mutex;
    use serde_json::json;

    use super::{DispatcherConfig, FanOutDispatcher};
    use crate::envelope::{ClassifiedPayload, decode};

    struct RecordingSink {
        name: String,
        seen: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn named(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_owned(),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().clone()
        }
    }

    #[async_trait]
    impl Sink for RecordingSink {
        fn name(&self) -> &str {
            &self.name
        }

        async fn on_message(&self, event: &MessageEvent) -> Result<SinkOutcome, SinkError> {
            self.seen.lock().push(format!("message:{}", event.from));
            Ok(SinkOutcome::delivered("recorded"))
        }

        async fn on_status(&self, event: &StatusEvent) -> Result<SinkOutcome, SinkError> {
            self.seen.lock().push(format!("status:{}", event.status));
            Ok(SinkOutcome::delivered("recorded"))
        }

        async fn on_template_status(
            &self,
            update: &TemplateUpdate,
        ) -> Result<SinkOutcome, SinkError> {
            self.seen.lock().push(format!("template:{}", update.kind));
            Ok(SinkOutcome::delivered("recorded"))
        }
    }

    enum Misbehaviour {
        Error,
        Panic,
        Hang,
    }

    struct BrokenSink(Misbehaviour);

    #[async_trait]
    impl Sink for BrokenSink {
        fn name(&self) -> &str {
            "broken"
        }

        async fn on_message(&self, _event: &MessageEvent) -> Result<SinkOutcome, SinkError> {
            match self.0 {
                Misbehaviour::Error => Err(SinkError::request("broken", "connection refused")),
                Misbehaviour::Panic => panic!("sink exploded"),
                Misbehaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(SinkOutcome::delivered("too late"))
                }
            }
        }
    }

    fn message_batch(senders: &[&str]) -> (InboundEvent, ClassifiedPayload) {
        let messages: Vec<_> = senders
            .iter()
            .map(|from| json!({ "from": from, "type": "text", "text": { "body": "hi" } }))
            .collect();
        let raw = json!({
            "entry": [{ "changes": [{ "field": "messages", "value": { "messages": messages } }] }]
        });
        let id = EventId::new_uuid();
        let payload = decode(&id, &raw);
        let event = InboundEvent::with_id(id, raw, payload.kind(), true);
        (event, payload)
    }

    #[tokio::test]
    async fn every_sink_sees_every_message_in_order() {
        let first = RecordingSink::named("first");
        let second = RecordingSink::named("second");
        let dispatcher = FanOutDispatcher::default()
            .with_sink(first.clone())
            .with_sink(second.clone());

        let (event, payload) = message_batch(&["1", "2", "3"]);
        let report = dispatcher.dispatch(&event, &payload).await;

        let expected = vec!["message:1", "message:2", "message:3"];
        assert_eq!(first.seen(), expected);
        assert_eq!(second.seen(), expected);
        assert_eq!(report.calls.len(), 6);
        assert_eq!(report.failed_calls(), 0);
        assert_eq!(report.event_id, event.id);
        assert!(report.calls.iter().all(|call| call.handler == SinkHandler::Message));
    }

    #[tokio::test]
    async fn failing_sink_does_not_block_its_sibling() {
        for misbehaviour in [Misbehaviour::Error, Misbehaviour::Panic] {
            let healthy = RecordingSink::named("healthy");
            let dispatcher = FanOutDispatcher::default()
                .with_sink(Arc::new(BrokenSink(misbehaviour)))
                .with_sink(healthy.clone());

            let (event, payload) = message_batch(&["27765275317"]);
            let report = dispatcher.dispatch(&event, &payload).await;

            assert_eq!(healthy.seen(), vec!["message:27765275317"]);
            assert_eq!(report.failed_calls(), 1);
            let broken = report
                .calls
                .iter()
                .find(|call| call.sink == "broken")
                .expect("broken sink recorded");
            assert!(!broken.success);
        }
    }

    #[tokio::test]
    async fn panic_detail_is_recorded() {
        let dispatcher =
            FanOutDispatcher::default().with_sink(Arc::new(BrokenSink(Misbehaviour::Panic)));
        let (event, payload) = message_batch(&["1"]);
        let report = dispatcher.dispatch(&event, &payload).await;
        assert!(report.calls[0].detail.contains("sink exploded"));
    }

    #[tokio::test]
    async fn hung_sink_is_cut_off_by_timeout() {
        let healthy = RecordingSink::named("healthy");
        let sinks: Vec<Arc<dyn Sink>> =
            vec![Arc::new(BrokenSink(Misbehaviour::Hang)), healthy.clone()];
        let dispatcher = FanOutDispatcher::new(
            sinks,
            DispatcherConfig {
                sink_timeout: Some(Duration::from_millis(100)),
                ..DispatcherConfig::default()
            },
        );

        let (event, payload) = message_batch(&["1"]);
        let report = tokio::time::timeout(
            Duration::from_secs(5),
            dispatcher.dispatch(&event, &payload),
        )
        .await
        .expect("dispatch bounded by sink timeout");

        assert_eq!(healthy.seen(), vec!["message:1"]);
        let hung = &report.calls[0];
        assert!(!hung.success);
        assert!(hung.detail.contains("timed out"));
    }

    #[tokio::test]
    async fn statuses_follow_messages_and_templates_route_by_kind() {
        let sink = RecordingSink::named("recorder");
        let dispatcher = FanOutDispatcher::default().with_sink(sink.clone());

        let raw = json!({
            "entry": [{ "changes": [{ "field": "messages", "value": {
                "statuses": [{ "id": "wamid.1", "status": "delivered" }],
                "messages": [{ "from": "1", "type": "text", "text": { "body": "hi" } }]
            } }] }]
        });
        let id = EventId::new_uuid();
        let payload = decode(&id, &raw);
        let event = InboundEvent::with_id(id, raw, payload.kind(), true);
        dispatcher.dispatch(&event, &payload).await;

        let raw = json!({
            "entry": [{ "changes": [{ "field": "message_template_status_update", "value": { "event": "APPROVED" } }] }]
        });
        let id = EventId::new_uuid();
        let payload = decode(&id, &raw);
        let event = InboundEvent::with_id(id, raw, payload.kind(), true);
        let report = dispatcher.dispatch(&event, &payload).await;

        assert_eq!(
            sink.seen(),
            vec!["message:1", "status:delivered", "template:template_status_update"]
        );
        assert_eq!(report.calls[0].handler, SinkHandler::TemplateStatus);
    }

    #[tokio::test]
    async fn unclassified_events_reach_no_sink() {
        let sink = RecordingSink::named("recorder");
        let dispatcher = FanOutDispatcher::default().with_sink(sink.clone());

        let raw = json!({ "object": "page" });
        let id = EventId::new_uuid();
        let payload = decode(&id, &raw);
        let event = InboundEvent::with_id(id, raw, payload.kind(), true);
        let report = dispatcher.dispatch(&event, &payload).await;

        assert!(sink.seen().is_empty());
        assert!(report.calls.is_empty());
    }

    #[tokio::test]
    async fn default_handlers_skip_unhandled_kinds() {
        let dispatcher =
            FanOutDispatcher::default().with_sink(Arc::new(BrokenSink(Misbehaviour::Error)));
        let raw = json!({
            "entry": [{ "changes": [{ "field": "message_template_quality_update", "value": {} }] }]
        });
        let id = EventId::new_uuid();
        let payload = decode(&id, &raw);
        let event = InboundEvent::with_id(id, raw, payload.kind(), true);
        let report = dispatcher.dispatch(&event, &payload).await;

        assert_eq!(report.calls.len(), 1);
        assert!(report.calls[0].success);
        assert_eq!(report.calls[0].detail, "skipped");
    }
}

//! Classification of provider envelopes and their fan-out to sinks.
//!
//! [`envelope::decode`] turns a raw delivery into a [`ClassifiedPayload`]
//! once; [`FanOutDispatcher::dispatch`] then hands every entry to every sink
//! and returns a [`hookrelay_protocol::DispatchReport`].

mod dispatcher;
pub mod envelope;
pub mod sinks;

pub use dispatcher::{DispatcherConfig, FanOutDispatcher};
pub use envelope::{ClassifiedPayload, classify, decode};
pub use sinks::{ToolCrmSink, WorkflowIds, WorkflowSink, WorkflowSinkConfig};

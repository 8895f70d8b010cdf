//! # hookrelay-protocol
//!
//! Shared contract types for the hookrelay workspace: inbound event model,
//! tool-server descriptors and results, the sink port, and the error taxonomy.
//!
//! Like any contract crate it stays runtime-free (no tokio, axum, or reqwest)
//! so sinks can be implemented against it without pulling in the server.
//!
//! ## Module Overview
//!
//! - [`ids`]: Typed ID wrappers (EventId, ServerName)
//! - [`event`]: InboundEvent, EventKind, decoded message/status/template events, DispatchReport
//! - [`tool`]: ToolServerDescriptor, ConnectionState, ToolDescriptor, ToolInvocationResult
//! - [`ports`]: Sink trait and SinkOutcome
//! - [`error`]: RelayError, ConnectionError, SinkError

pub mod error;
pub mod event;
pub mod ids;
pub mod ports;
pub mod tool;

pub use error::{ConnectionError, RelayError, SinkError};
pub use event::{
    DispatchReport, EventKind, InboundEvent, MessageEvent, SinkCallRecord, StatusEvent,
    TemplateUpdate, duration_ms,
};
pub use ids::{EventId, ServerName};
pub use ports::{Sink, SinkHandler, SinkOutcome};
pub use tool::{
    ConnectionState, ToolDescriptor, ToolInvocationResult, ToolServerDescriptor,
    ToolServerStatus,
};

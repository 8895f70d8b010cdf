mod crm;
mod workflow;

pub use crm::ToolCrmSink;
pub use workflow::{WorkflowIds, WorkflowSink, WorkflowSinkConfig};

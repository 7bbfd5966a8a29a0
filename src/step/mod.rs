pub mod body;
pub mod context;
pub mod environment;
pub mod execution;

pub use body::{
    BodyContext, BodyExecution, BodyInvocation, BodyOutcome, BodyRunner, CancelToken,
    CompletionHandle, ThreadBodyRunner,
};
pub use context::{
    BufferLogSink, ExecutionGraphNode, FileLogSink, FlowNodeRecord, LogSink, WorkspaceAction,
};
pub use environment::{
    expand_environment, merge_expanders, EnvVars, EnvironmentExpander, VariableOverrides,
    WorkspaceExpander, WORKSPACE_VAR,
};
pub use execution::{
    StepContext, StepState, StepStatus, WorkspaceStepConfig, WorkspaceStepExecution, STEP_NAME,
};

use super::body::{BodyExecution, BodyInvocation, BodyOutcome, BodyRunner, CompletionHandle};
use super::context::{ExecutionGraphNode, LogSink, WorkspaceAction};
use super::environment::{merge_expanders, EnvironmentExpander, WorkspaceExpander};
use crate::node::{ExecutionNode, Job};
use crate::shared::errors::WorkspaceError;
use crate::shared::ids::ExecutionId;
use crate::shared::logging::append_event_log;
use crate::shared::time::now_secs;
use crate::workspace::{resolve_base_path, Lease, LeaseStore, RecoveredLease, WorkspaceLeases};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub const STEP_NAME: &str = "workspace";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkspaceStepConfig {
    #[serde(default)]
    dir: Option<String>,
}

impl WorkspaceStepConfig {
    pub fn new(dir: Option<&str>) -> Self {
        Self {
            dir: dir.map(str::to_string),
        }
        .normalized()
    }

    pub fn from_args(args: &Value) -> Result<Self, WorkspaceError> {
        if args.is_null() {
            return Ok(Self::default());
        }
        let config: Self = serde_json::from_value(args.clone())
            .map_err(|err| WorkspaceError::InvalidArguments(err.to_string()))?;
        Ok(config.normalized())
    }

    pub fn dir(&self) -> Option<&str> {
        self.dir.as_deref()
    }

    fn normalized(self) -> Self {
        Self {
            dir: self
                .dir
                .map(|dir| dir.trim().to_string())
                .filter(|dir| !dir.is_empty()),
        }
    }
}

/// Everything a workspace step needs from the engine, passed in explicitly.
#[derive(Clone)]
pub struct StepContext {
    pub execution_id: ExecutionId,
    pub job: Job,
    pub node: Arc<dyn ExecutionNode>,
    pub log: Arc<dyn LogSink>,
    pub flow_node: Arc<dyn ExecutionGraphNode>,
    pub environment: Option<Arc<dyn EnvironmentExpander>>,
    pub leases: Arc<WorkspaceLeases>,
    pub runner: Arc<dyn BodyRunner>,
    pub store: Option<LeaseStore>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    NotStarted,
    Running,
    Completed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepStatus {
    NotStarted,
    Pending { workspace: PathBuf },
    Completed(BodyOutcome),
}

impl StepStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, StepStatus::Completed(_))
    }
}

struct StepInner {
    state: StepState,
    lease: Option<Lease>,
    body: Option<Arc<dyn BodyExecution>>,
}

pub struct WorkspaceStepExecution {
    context: StepContext,
    config: WorkspaceStepConfig,
    inner: Arc<Mutex<StepInner>>,
    completion: CompletionHandle,
}

impl WorkspaceStepExecution {
    pub fn new(context: StepContext, config: WorkspaceStepConfig) -> Self {
        Self {
            context,
            config,
            inner: Arc::new(Mutex::new(StepInner {
                state: StepState::NotStarted,
                lease: None,
                body: None,
            })),
            completion: CompletionHandle::new(),
        }
    }

    pub fn from_args(context: StepContext, args: &Value) -> Result<Self, WorkspaceError> {
        Ok(Self::new(context, WorkspaceStepConfig::from_args(args)?))
    }

    /// Re-attaches a lease recovered after a restart to the resumed body it belongs to.
    pub fn resume(
        context: StepContext,
        config: WorkspaceStepConfig,
        recovered: RecoveredLease,
        body: Arc<dyn BodyExecution>,
        body_completion: CompletionHandle,
    ) -> Result<Self, WorkspaceError> {
        if recovered.execution_id != context.execution_id {
            return Err(WorkspaceError::Configuration(format!(
                "recovered lease belongs to execution `{}`, not `{}`",
                recovered.execution_id, context.execution_id
            )));
        }
        let execution = Self::new(context, config);
        {
            let mut inner = execution.lock();
            inner.state = StepState::Running;
            inner.lease = Some(recovered.lease.clone());
            inner.body = Some(body);
        }
        execution.register_release(recovered.lease, body_completion);
        Ok(execution)
    }

    /// Leases the workspace and starts the body; never waits for the body to finish.
    pub fn start(&self) -> Result<StepStatus, WorkspaceError> {
        let mut inner = self.lock();
        if inner.state != StepState::NotStarted {
            return Err(WorkspaceError::AlreadyStarted);
        }

        let context = &self.context;
        let base_path = resolve_base_path(context.node.as_ref(), &context.job, self.config.dir())?;
        let lease = context
            .leases
            .for_node(context.node.name())
            .allocate(&base_path, context.execution_id.as_str())?;

        if let Some(store) = &context.store {
            if let Err(err) = store.save(&lease.to_record(&context.execution_id)) {
                lease.release();
                return Err(err);
            }
            append_event_log(
                store.paths(),
                "info",
                "workspace.lease.acquired",
                &format!(
                    "execution_id={} node={} path={} ordinal={}",
                    context.execution_id,
                    lease.node(),
                    lease.path().display(),
                    lease.ordinal()
                ),
            );
        }

        let workspace = lease.path().to_path_buf();
        let environment = merge_expanders(
            context.environment.clone(),
            Arc::new(WorkspaceExpander::new(&workspace)),
        );
        let body_completion = CompletionHandle::new();
        let invocation = BodyInvocation {
            environment,
            working_directory: workspace.clone(),
        };
        let body = match context.runner.start(invocation, body_completion.clone()) {
            Ok(body) => body,
            Err(err) => {
                self.discard_lease(&lease, &err);
                return Err(err);
            }
        };

        // Published only once the body is known to run in this workspace.
        context.flow_node.attach(WorkspaceAction {
            flow_node_id: context.flow_node.id().to_string(),
            node: context.node.name().clone(),
            path: workspace.clone(),
            labels: context.node.labels(),
            recorded_at: now_secs(),
        });
        context
            .log
            .line(&format!("Running in {}", workspace.display()));

        inner.state = StepState::Running;
        inner.lease = Some(lease.clone());
        inner.body = Some(body);
        drop(inner);

        self.register_release(lease, body_completion);
        Ok(StepStatus::Pending { workspace })
    }

    /// Forwards cancellation to the running body. The lease is released by the body's
    /// completion, never here.
    pub fn stop(&self, cause: &str) -> bool {
        let body = {
            let inner = self.lock();
            if inner.state != StepState::Running {
                return false;
            }
            inner.body.clone()
        };
        match body {
            Some(body) => body.cancel(cause),
            None => false,
        }
    }

    pub fn state(&self) -> StepState {
        self.lock().state
    }

    pub fn status(&self) -> StepStatus {
        if let Some(outcome) = self.completion.outcome() {
            return StepStatus::Completed(outcome);
        }
        let inner = self.lock();
        match (&inner.state, &inner.lease) {
            (StepState::NotStarted, _) | (_, None) => StepStatus::NotStarted,
            (_, Some(lease)) => StepStatus::Pending {
                workspace: lease.path().to_path_buf(),
            },
        }
    }

    pub fn lease(&self) -> Option<Lease> {
        self.lock().lease.clone()
    }

    pub fn workspace(&self) -> Option<PathBuf> {
        self.lock()
            .lease
            .as_ref()
            .map(|lease| lease.path().to_path_buf())
    }

    pub fn config(&self) -> &WorkspaceStepConfig {
        &self.config
    }

    /// Completes after the lease has been released.
    pub fn completion(&self) -> CompletionHandle {
        self.completion.clone()
    }

    pub fn wait(&self) -> BodyOutcome {
        self.completion.wait()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<BodyOutcome> {
        self.completion.wait_timeout(timeout)
    }

    fn lock(&self) -> MutexGuard<'_, StepInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register_release(&self, lease: Lease, body_completion: CompletionHandle) {
        let inner = Arc::clone(&self.inner);
        let step_completion = self.completion.clone();
        let store = self.context.store.clone();
        let execution_id = self.context.execution_id.clone();

        body_completion.on_complete(move |outcome| {
            release_lease(&lease, store.as_ref(), &execution_id, outcome.label());
            {
                let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
                inner.state = StepState::Completed;
                inner.body = None;
            }
            step_completion.complete(outcome.clone());
        });
    }

    fn discard_lease(&self, lease: &Lease, cause: &WorkspaceError) {
        if let Some(store) = &self.context.store {
            append_event_log(
                store.paths(),
                "error",
                "workspace.body.start_failed",
                &format!("execution_id={}: {cause}", self.context.execution_id),
            );
        }
        release_lease(
            lease,
            self.context.store.as_ref(),
            &self.context.execution_id,
            "not_started",
        );
    }
}

fn release_lease(
    lease: &Lease,
    store: Option<&LeaseStore>,
    execution_id: &ExecutionId,
    outcome: &str,
) {
    if !lease.release() {
        return;
    }
    let Some(store) = store else {
        return;
    };
    if let Err(err) = store.remove(&lease.to_record(execution_id)) {
        append_event_log(
            store.paths(),
            "warn",
            "workspace.lease.record_failed",
            &format!("execution_id={execution_id}: {err}"),
        );
    }
    append_event_log(
        store.paths(),
        "info",
        "workspace.lease.released",
        &format!(
            "execution_id={} node={} path={} outcome={}",
            execution_id,
            lease.node(),
            lease.path().display(),
            outcome
        ),
    );
}

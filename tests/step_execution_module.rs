use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tempfile::tempdir;
use workspace_lease::config::StatePaths;
use workspace_lease::node::{ExecutionNode, Job, LocalNode};
use workspace_lease::shared::errors::WorkspaceError;
use workspace_lease::shared::ids::{ExecutionId, NodeName};
use workspace_lease::step::{
    BodyExecution, BodyInvocation, BodyOutcome, BodyRunner, BufferLogSink, CompletionHandle,
    FlowNodeRecord, StepContext, StepState, StepStatus, ThreadBodyRunner, VariableOverrides,
    WorkspaceStepConfig, WorkspaceStepExecution,
};
use workspace_lease::workspace::{recover_leases, LeaseStore, WorkspaceLeases};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Gate {
    open: Mutex<bool>,
    opened: Condvar,
}

impl Gate {
    fn open(&self) {
        *self.open.lock().expect("lock") = true;
        self.opened.notify_all();
    }

    fn wait(&self) {
        let guard = self.open.lock().expect("lock");
        let _guard = self
            .opened
            .wait_while(guard, |open| !*open)
            .expect("wait");
    }
}

struct FailingRunner;

impl BodyRunner for FailingRunner {
    fn start(
        &self,
        _invocation: BodyInvocation,
        _completion: CompletionHandle,
    ) -> Result<Arc<dyn BodyExecution>, WorkspaceError> {
        Err(WorkspaceError::BodyStart("executor pool exhausted".to_string()))
    }
}

struct Harness {
    node: Arc<LocalNode>,
    leases: Arc<WorkspaceLeases>,
    log: Arc<BufferLogSink>,
    flow_node: Arc<FlowNodeRecord>,
    store: Option<LeaseStore>,
}

impl Harness {
    fn new() -> Self {
        Self {
            node: Arc::new(LocalNode::new(
                NodeName::parse("agent-1").expect("node"),
                "/srv/agent",
            )),
            leases: Arc::new(WorkspaceLeases::new("@")),
            log: Arc::new(BufferLogSink::new()),
            flow_node: Arc::new(FlowNodeRecord::new("7")),
            store: None,
        }
    }

    fn with_store(mut self, root: &Path) -> Self {
        self.store = Some(LeaseStore::new(StatePaths::new(root)));
        self
    }

    fn context(&self, execution_id: &str, runner: Arc<dyn BodyRunner>) -> StepContext {
        StepContext {
            execution_id: ExecutionId::parse(execution_id).expect("execution id"),
            job: Job::pipeline("deploy").expect("job"),
            node: self.node.clone(),
            log: self.log.clone(),
            flow_node: self.flow_node.clone(),
            environment: None,
            leases: Arc::clone(&self.leases),
            runner,
            store: self.store.clone(),
        }
    }

    fn registry_len(&self) -> usize {
        self.leases.for_node(self.node.name()).len()
    }
}

fn echo_workspace() -> Arc<dyn BodyRunner> {
    Arc::new(ThreadBodyRunner::new(|ctx| {
        Ok(json!(ctx.environment.get("WORKSPACE")))
    }))
}

fn gated(gate: &Arc<Gate>, result: Result<Value, String>) -> Arc<dyn BodyRunner> {
    let gate = Arc::clone(gate);
    Arc::new(ThreadBodyRunner::new(move |_| {
        gate.wait();
        result.clone()
    }))
}

fn event_count(root: &Path, event: &str) -> usize {
    let raw = fs::read_to_string(StatePaths::new(root).event_log_path()).unwrap_or_default();
    raw.lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter(|entry| entry["event"] == event)
        .count()
}

#[test]
fn body_sees_leased_workspace_and_log_names_it() {
    let harness = Harness::new();
    let step = WorkspaceStepExecution::new(
        harness.context("exec-1", echo_workspace()),
        WorkspaceStepConfig::default(),
    );

    let status = step.start().expect("start");
    assert_eq!(
        status,
        StepStatus::Pending {
            workspace: PathBuf::from("/srv/agent/workspace/deploy")
        }
    );

    let outcome = step.wait_timeout(WAIT).expect("finished");
    assert_eq!(
        outcome,
        BodyOutcome::Succeeded {
            result: json!("/srv/agent/workspace/deploy")
        }
    );
    assert_eq!(
        harness.log.lines(),
        vec!["Running in /srv/agent/workspace/deploy".to_string()]
    );

    let actions = harness.flow_node.actions();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].flow_node_id, "7");
    assert_eq!(actions[0].node.as_str(), "agent-1");
    assert_eq!(actions[0].path, PathBuf::from("/srv/agent/workspace/deploy"));
}

#[test]
fn concurrent_steps_of_one_job_get_suffixed_workspaces() {
    let harness = Harness::new();
    let gate = Arc::new(Gate::default());

    let first = WorkspaceStepExecution::new(
        harness.context("exec-1", gated(&gate, Ok(json!(1)))),
        WorkspaceStepConfig::default(),
    );
    let second = WorkspaceStepExecution::new(
        harness.context("exec-2", gated(&gate, Ok(json!(2)))),
        WorkspaceStepConfig::default(),
    );
    first.start().expect("first");
    second.start().expect("second");

    assert_eq!(
        first.workspace(),
        Some(PathBuf::from("/srv/agent/workspace/deploy"))
    );
    assert_eq!(
        second.workspace(),
        Some(PathBuf::from("/srv/agent/workspace/deploy@2"))
    );
    assert_eq!(first.state(), StepState::Running);

    gate.open();
    assert!(first.wait_timeout(WAIT).expect("first done").is_success());
    assert!(second.wait_timeout(WAIT).expect("second done").is_success());
    assert_eq!(harness.registry_len(), 0);
}

#[test]
fn lease_is_released_before_step_completion_is_observed() {
    let harness = Harness::new();
    let step = WorkspaceStepExecution::new(
        harness.context("exec-1", echo_workspace()),
        WorkspaceStepConfig::default(),
    );
    step.start().expect("start");
    step.wait_timeout(WAIT).expect("finished");

    let lease = step.lease().expect("lease");
    assert!(!lease.is_held());
    assert_eq!(step.state(), StepState::Completed);
    assert!(step.status().is_finished());

    let next = harness
        .leases
        .for_node(harness.node.name())
        .allocate(Path::new("/srv/agent/workspace/deploy"), "exec-2")
        .expect("allocate");
    assert_eq!(next.path(), Path::new("/srv/agent/workspace/deploy"));
}

#[test]
fn failed_body_still_releases_and_propagates_failure() {
    let harness = Harness::new();
    let runner = Arc::new(ThreadBodyRunner::new(|_| Err("tests failed".to_string())));
    let step = WorkspaceStepExecution::new(
        harness.context("exec-1", runner),
        WorkspaceStepConfig::default(),
    );
    step.start().expect("start");

    assert_eq!(
        step.wait_timeout(WAIT),
        Some(BodyOutcome::Failed {
            error: "tests failed".to_string()
        })
    );
    assert_eq!(harness.registry_len(), 0);
}

#[test]
fn stop_cancels_body_and_releases_exactly_once() {
    let temp = tempdir().expect("tempdir");
    let harness = Harness::new().with_store(temp.path());
    let runner = Arc::new(ThreadBodyRunner::new(|ctx| {
        if ctx.cancel.sleep(Duration::from_secs(10)) {
            Ok(json!("finished"))
        } else {
            Err("interrupted".to_string())
        }
    }));
    let step = WorkspaceStepExecution::new(
        harness.context("exec-1", runner),
        WorkspaceStepConfig::default(),
    );
    step.start().expect("start");

    assert!(step.stop("aborted by user"));
    let outcome = step.wait_timeout(WAIT).expect("finished");
    assert_eq!(
        outcome,
        BodyOutcome::Cancelled {
            cause: "aborted by user".to_string()
        }
    );

    let lease = step.lease().expect("lease");
    assert!(!lease.release());
    assert!(!step.stop("again"));
    assert_eq!(harness.registry_len(), 0);
    assert_eq!(event_count(temp.path(), "workspace.lease.released"), 1);
}

#[test]
fn offline_node_fails_synchronously_without_leasing() {
    let harness = Harness::new();
    harness.node.set_online(false);
    let step = WorkspaceStepExecution::new(
        harness.context("exec-1", echo_workspace()),
        WorkspaceStepConfig::new(Some("custom")),
    );

    let err = step.start().expect_err("offline");
    assert!(matches!(err, WorkspaceError::NodeUnavailable { .. }));
    assert_eq!(step.state(), StepState::NotStarted);
    assert_eq!(step.status(), StepStatus::NotStarted);
    assert_eq!(harness.registry_len(), 0);
    assert!(harness.log.lines().is_empty());
}

#[test]
fn second_start_is_rejected() {
    let harness = Harness::new();
    let gate = Arc::new(Gate::default());
    let step = WorkspaceStepExecution::new(
        harness.context("exec-1", gated(&gate, Ok(Value::Null))),
        WorkspaceStepConfig::default(),
    );
    step.start().expect("start");

    assert!(matches!(step.start(), Err(WorkspaceError::AlreadyStarted)));
    assert_eq!(harness.registry_len(), 1);

    gate.open();
    step.wait_timeout(WAIT).expect("finished");
    assert!(matches!(step.start(), Err(WorkspaceError::AlreadyStarted)));
}

#[test]
fn runner_start_failure_releases_the_lease() {
    let temp = tempdir().expect("tempdir");
    let harness = Harness::new().with_store(temp.path());
    let step = WorkspaceStepExecution::new(
        harness.context("exec-1", Arc::new(FailingRunner)),
        WorkspaceStepConfig::default(),
    );

    let err = step.start().expect_err("runner fails");
    assert!(matches!(err, WorkspaceError::BodyStart(_)));
    assert_eq!(harness.registry_len(), 0);
    assert_eq!(step.state(), StepState::NotStarted);

    let store = harness.store.as_ref().expect("store");
    assert!(store.load_all().expect("load all").is_empty());
    assert_eq!(event_count(temp.path(), "workspace.body.start_failed"), 1);
    assert_eq!(event_count(temp.path(), "workspace.lease.released"), 1);
}

#[test]
fn runner_start_failure_publishes_no_workspace() {
    let harness = Harness::new();
    let step = WorkspaceStepExecution::new(
        harness.context("exec-1", Arc::new(FailingRunner)),
        WorkspaceStepConfig::default(),
    );

    step.start().expect_err("runner fails");
    assert!(harness.log.lines().is_empty());
    assert!(harness.flow_node.actions().is_empty());
}

#[test]
fn explicit_dir_shares_the_node_registry() {
    let harness = Harness::new();
    let gate = Arc::new(Gate::default());
    let first = WorkspaceStepExecution::new(
        harness.context("exec-1", gated(&gate, Ok(Value::Null))),
        WorkspaceStepConfig::new(Some("  shared/cache  ")),
    );
    let second = WorkspaceStepExecution::new(
        harness.context("exec-2", gated(&gate, Ok(Value::Null))),
        WorkspaceStepConfig::new(Some("shared/cache")),
    );
    first.start().expect("first");
    second.start().expect("second");

    assert_eq!(
        first.workspace(),
        Some(PathBuf::from("/srv/agent/shared/cache"))
    );
    assert_eq!(
        second.workspace(),
        Some(PathBuf::from("/srv/agent/shared/cache@2"))
    );
    gate.open();
    first.wait_timeout(WAIT).expect("first done");
    second.wait_timeout(WAIT).expect("second done");
}

#[test]
fn enclosing_environment_is_kept_under_the_workspace_variable() {
    let harness = Harness::new();
    let runner = Arc::new(ThreadBodyRunner::new(|ctx| {
        Ok(json!({
            "workspace": ctx.environment.get("WORKSPACE"),
            "tag": ctx.environment.get("BUILD_TAG"),
        }))
    }));
    let mut context = harness.context("exec-1", runner);
    context.environment = Some(Arc::new(VariableOverrides::new([
        ("WORKSPACE", "/outer"),
        ("BUILD_TAG", "tag-7"),
    ])));
    let step = WorkspaceStepExecution::new(context, WorkspaceStepConfig::default());
    step.start().expect("start");

    assert_eq!(
        step.wait_timeout(WAIT),
        Some(BodyOutcome::Succeeded {
            result: json!({
                "workspace": "/srv/agent/workspace/deploy",
                "tag": "tag-7",
            })
        })
    );
}

#[test]
fn durable_record_lives_while_the_body_runs() {
    let temp = tempdir().expect("tempdir");
    let harness = Harness::new().with_store(temp.path());
    let gate = Arc::new(Gate::default());
    let step = WorkspaceStepExecution::new(
        harness.context("exec-1", gated(&gate, Ok(Value::Null))),
        WorkspaceStepConfig::default(),
    );
    step.start().expect("start");

    let store = harness.store.as_ref().expect("store");
    let id = ExecutionId::parse("exec-1").expect("id");
    let records = store.load_for(&id).expect("load");
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.path, PathBuf::from("/srv/agent/workspace/deploy"));
    assert_eq!(record.ordinal, 1);
    assert_eq!(event_count(temp.path(), "workspace.lease.acquired"), 1);

    gate.open();
    step.wait_timeout(WAIT).expect("finished");
    assert!(store.load_for(&id).expect("load").is_empty());
}

#[test]
fn resumed_step_releases_recovered_lease_when_body_completes() {
    let temp = tempdir().expect("tempdir");
    let harness = Harness::new().with_store(temp.path());
    let store = harness.store.clone().expect("store");
    let execution_id = ExecutionId::parse("exec-1").expect("id");

    let before_restart = WorkspaceLeases::new("@");
    let lease = before_restart
        .for_node(harness.node.name())
        .allocate(Path::new("/srv/agent/workspace/deploy"), "exec-1")
        .expect("allocate");
    store.save(&lease.to_record(&execution_id)).expect("save");

    let mut recovered = recover_leases(&store, &harness.leases).expect("recover");
    assert_eq!(recovered.len(), 1);
    assert_eq!(harness.registry_len(), 1);

    let gate = Arc::new(Gate::default());
    let runner = gated(&gate, Ok(json!("resumed")));
    let body_completion = CompletionHandle::new();
    let body = runner
        .start(
            BodyInvocation {
                environment: Arc::new(VariableOverrides::default()),
                working_directory: PathBuf::from("/srv/agent/workspace/deploy"),
            },
            body_completion.clone(),
        )
        .expect("body");

    let step = WorkspaceStepExecution::resume(
        harness.context("exec-1", runner),
        WorkspaceStepConfig::default(),
        recovered.remove(0),
        body,
        body_completion,
    )
    .expect("resume");
    assert_eq!(step.state(), StepState::Running);

    gate.open();
    assert_eq!(
        step.wait_timeout(WAIT),
        Some(BodyOutcome::Succeeded {
            result: json!("resumed")
        })
    );
    assert_eq!(harness.registry_len(), 0);
    assert!(store.load_for(&execution_id).expect("load").is_empty());
}

#[test]
fn resume_rejects_lease_of_another_execution() {
    let harness = Harness::new();
    let lease = harness
        .leases
        .for_node(harness.node.name())
        .allocate(Path::new("/srv/agent/workspace/deploy"), "exec-9")
        .expect("allocate");
    let recovered = workspace_lease::workspace::RecoveredLease {
        execution_id: ExecutionId::parse("exec-9").expect("id"),
        lease,
    };
    let body_completion = CompletionHandle::new();
    let body = echo_workspace()
        .start(
            BodyInvocation {
                environment: Arc::new(VariableOverrides::default()),
                working_directory: PathBuf::from("/srv/agent/workspace/deploy"),
            },
            body_completion.clone(),
        )
        .expect("body");

    let result = WorkspaceStepExecution::resume(
        harness.context("exec-1", echo_workspace()),
        WorkspaceStepConfig::default(),
        recovered,
        body,
        body_completion,
    );
    assert!(matches!(result, Err(WorkspaceError::Configuration(_))));
}

#[test]
fn step_arguments_reject_unknown_keys_and_trim_dir() {
    let config = WorkspaceStepConfig::from_args(&json!({ "dir": "  build/out " })).expect("args");
    assert_eq!(config.dir(), Some("build/out"));

    let blank = WorkspaceStepConfig::from_args(&json!({ "dir": "   " })).expect("args");
    assert_eq!(blank.dir(), None);

    assert_eq!(
        WorkspaceStepConfig::from_args(&Value::Null).expect("null args"),
        WorkspaceStepConfig::default()
    );

    let err = WorkspaceStepConfig::from_args(&json!({ "directory": "x" })).expect_err("unknown");
    assert!(matches!(err, WorkspaceError::InvalidArguments(_)));
}

#[test]
fn from_args_builds_a_runnable_step() {
    let harness = Harness::new();
    let step = WorkspaceStepExecution::from_args(
        harness.context("exec-1", echo_workspace()),
        &json!({ "dir": "/tmp/scratch" }),
    )
    .expect("step");
    step.start().expect("start");
    assert_eq!(
        step.wait_timeout(WAIT),
        Some(BodyOutcome::Succeeded {
            result: json!("/tmp/scratch")
        })
    );
}

#[test]
fn steps_sharing_an_execution_id_keep_separate_records() {
    let temp = tempdir().expect("tempdir");
    let harness = Harness::new().with_store(temp.path());
    let first_gate = Arc::new(Gate::default());
    let second_gate = Arc::new(Gate::default());
    let first = WorkspaceStepExecution::new(
        harness.context("deploy_42", gated(&first_gate, Ok(Value::Null))),
        WorkspaceStepConfig::default(),
    );
    let second = WorkspaceStepExecution::new(
        harness.context("deploy_42", gated(&second_gate, Ok(Value::Null))),
        WorkspaceStepConfig::default(),
    );
    first.start().expect("first");
    second.start().expect("second");

    let store = harness.store.clone().expect("store");
    let id = ExecutionId::parse("deploy_42").expect("id");
    assert_eq!(store.load_for(&id).expect("load").len(), 2);

    first_gate.open();
    first.wait_timeout(WAIT).expect("first done");
    let remaining: Vec<PathBuf> = store
        .load_for(&id)
        .expect("load")
        .into_iter()
        .map(|record| record.path)
        .collect();
    assert_eq!(
        remaining,
        vec![PathBuf::from("/srv/agent/workspace/deploy@2")]
    );

    let after_restart = WorkspaceLeases::new("@");
    let recovered = recover_leases(&store, &after_restart).expect("recover");
    assert_eq!(recovered.len(), 1);
    let registry = after_restart.for_node(harness.node.name());
    let base = Path::new("/srv/agent/workspace/deploy");
    let a = registry.allocate(base, "next-1").expect("allocate");
    let b = registry.allocate(base, "next-2").expect("allocate");
    assert_eq!(a.path(), base);
    assert_eq!(b.path(), Path::new("/srv/agent/workspace/deploy@3"));

    second_gate.open();
    second.wait_timeout(WAIT).expect("second done");
    assert!(store.load_for(&id).expect("load").is_empty());
}

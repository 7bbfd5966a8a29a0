use std::path::{Path, PathBuf};
use workspace_lease::node::{ExecutionNode, Job, JobKind, LocalNode};
use workspace_lease::shared::errors::WorkspaceError;
use workspace_lease::shared::ids::{JobName, NodeName};
use workspace_lease::workspace::{resolve_base_path, temp_dir_for, WorkspaceLeases};

fn agent() -> LocalNode {
    LocalNode::new(NodeName::parse("agent-1").expect("node"), "/srv/agent")
}

#[test]
fn unset_dir_resolves_to_per_job_workspace_root() {
    let job = Job::pipeline("team/deploy").expect("job");
    let base = resolve_base_path(&agent(), &job, None).expect("resolve");
    assert_eq!(base, PathBuf::from("/srv/agent/workspace/team/deploy"));
}

#[test]
fn explicit_relative_dir_is_placed_under_node_root() {
    let job = Job::pipeline("deploy").expect("job");
    let base = resolve_base_path(&agent(), &job, Some("shared/cache")).expect("resolve");
    assert_eq!(base, PathBuf::from("/srv/agent/shared/cache"));
}

#[test]
fn explicit_absolute_dir_replaces_node_root() {
    let job = Job::pipeline("deploy").expect("job");
    let base = resolve_base_path(&agent(), &job, Some("/mnt/scratch/./deploy")).expect("resolve");
    assert_eq!(base, PathBuf::from("/mnt/scratch/deploy"));
}

#[test]
fn explicit_dir_may_name_another_jobs_default_workspace() {
    let job = Job::pipeline("deploy").expect("job");
    let base = resolve_base_path(&agent(), &job, Some("workspace/other/../build")).expect("resolve");
    assert_eq!(base, PathBuf::from("/srv/agent/workspace/build"));
}

#[test]
fn escaping_the_filesystem_root_is_rejected() {
    let node = LocalNode::new(NodeName::parse("agent-1").expect("node"), "/srv");
    let job = Job::pipeline("deploy").expect("job");
    let err = resolve_base_path(&node, &job, Some("../../..")).expect_err("escape");
    assert!(matches!(err, WorkspaceError::PathValidation { .. }));
}

#[test]
fn offline_node_is_unavailable_and_leaves_registry_untouched() {
    let node = agent();
    node.set_online(false);
    let leases = WorkspaceLeases::new("@");
    let job = Job::pipeline("deploy").expect("job");

    for dir in [None, Some("custom")] {
        let err = resolve_base_path(&node, &job, dir).expect_err("offline");
        match err {
            WorkspaceError::NodeUnavailable { node } => assert_eq!(node, "agent-1"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
    assert!(leases.for_node(node.name()).is_empty());
}

#[test]
fn nested_jobs_are_rejected_before_node_liveness() {
    let node = agent();
    node.set_online(false);
    let job = Job::new(
        JobName::parse("matrix/cell-linux").expect("name"),
        JobKind::Ephemeral,
    );

    let err = resolve_base_path(&node, &job, None).expect_err("nested job");
    match err {
        WorkspaceError::Configuration(message) => {
            assert!(message.contains("must be a top-level job"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn temp_dir_is_a_sibling_with_tmp_suffix() {
    assert_eq!(
        temp_dir_for(Path::new("/srv/agent/workspace/deploy@2"), "@"),
        PathBuf::from("/srv/agent/workspace/deploy@2@tmp")
    );
}

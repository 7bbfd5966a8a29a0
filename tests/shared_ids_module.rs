use workspace_lease::shared::ids::{ExecutionId, JobName, NodeName};

#[test]
fn shared_ids_module_parses_domain_identifiers() {
    assert_eq!(NodeName::parse("built-in").expect("id").as_str(), "built-in");
    assert_eq!(
        ExecutionId::parse("deploy_42").expect("id").as_str(),
        "deploy_42"
    );
    assert_eq!(
        JobName::parse("team/deploy").expect("id").as_str(),
        "team/deploy"
    );

    assert!(NodeName::parse("agent 1").is_err());
    assert!(NodeName::parse("agent/1").is_err());
    assert!(ExecutionId::parse("").is_err());
    assert!(JobName::parse("team//deploy").is_err());
    assert!(JobName::parse("../deploy").is_err());
}

#[test]
fn shared_ids_deserialize_with_validation() {
    let node: NodeName = serde_json::from_str("\"agent-1\"").expect("node");
    assert_eq!(node.to_string(), "agent-1");
    assert!(serde_json::from_str::<NodeName>("\"..\"").is_err());
}

use std::fs;
use tempfile::tempdir;
use workspace_lease::config::{bootstrap_state_root, StatePaths};
use workspace_lease::shared::logging::append_event_log;

#[test]
fn event_log_writes_json_lines() {
    let tmp = tempdir().expect("tempdir");
    let paths = StatePaths::new(tmp.path().join(".workspace-lease"));
    bootstrap_state_root(&paths).expect("bootstrap state root");

    append_event_log(&paths, "info", "workspace.test", "hello workspace");
    append_event_log(&paths, "warn", "workspace.test", "second line");

    let log = fs::read_to_string(paths.event_log_path()).expect("read event log");
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("\"level\":\"info\""));
    assert!(lines[0].contains("\"event\":\"workspace.test\""));
    assert!(lines[0].contains("\"message\":\"hello workspace\""));
    assert!(lines[1].contains("\"level\":\"warn\""));
}

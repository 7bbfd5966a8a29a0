use std::fs;
use tempfile::tempdir;
use workspace_lease::step::{FileLogSink, LogSink};

#[test]
fn file_log_sink_appends_lines_and_creates_parents() {
    let temp = tempdir().expect("tempdir");
    let path = temp.path().join("executions/exec-1/console.log");
    let sink = FileLogSink::new(&path);

    sink.line("Running in /srv/agent/workspace/deploy");
    sink.line("build finished");

    assert_eq!(sink.path(), path.as_path());
    let raw = fs::read_to_string(&path).expect("read console log");
    assert_eq!(
        raw.lines().collect::<Vec<_>>(),
        vec!["Running in /srv/agent/workspace/deploy", "build finished"]
    );
}

//! Spawn-layer integration tests using real child processes.

use std::{collections::HashMap, path::PathBuf, time::Duration};

use autodev_executors::spawn::{LineSource, SpawnError, SpawnSpec, spawn};

fn sh_spec(script: &str) -> SpawnSpec {
    SpawnSpec {
        command: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        cwd: PathBuf::from("/tmp"),
        env: HashMap::new(),
        stdin_payload: None,
    }
}

#[tokio::test]
async fn captures_both_streams_in_arrival_order() {
    let mut child = spawn(&sh_spec("echo out1; echo err1 >&2; echo out2"))
        .await
        .unwrap();
    let mut output = child.take_output().unwrap();

    let status = child.wait().await.unwrap();
    assert!(status.success());

    let mut stdout_lines = Vec::new();
    let mut stderr_lines = Vec::new();
    while let Some(line) = output.recv().await {
        match line.source {
            LineSource::Stdout => stdout_lines.push(line.content),
            LineSource::Stderr => stderr_lines.push(line.content),
        }
    }
    assert_eq!(stdout_lines, vec!["out1", "out2"]);
    assert_eq!(stderr_lines, vec!["err1"]);
}

#[tokio::test]
async fn exit_code_is_reported_not_errored() {
    let mut child = spawn(&sh_spec("exit 2")).await.unwrap();
    let status = child.wait().await.unwrap();
    assert_eq!(status.code(), Some(2));
}

#[tokio::test]
async fn stdin_payload_reaches_the_child() {
    let mut spec = sh_spec("cat");
    spec.stdin_payload = Some("{\"task\":\"demo\"}\n".to_string());
    let mut child = spawn(&spec).await.unwrap();
    let mut output = child.take_output().unwrap();

    child.wait().await.unwrap();
    let mut lines = Vec::new();
    while let Some(line) = output.recv().await {
        lines.push(line.content);
    }
    assert_eq!(lines, vec!["{\"task\":\"demo\"}"]);
}

#[tokio::test]
async fn terminate_is_prompt_and_idempotent() {
    let mut child = spawn(&sh_spec("sleep 30")).await.unwrap();

    let started = std::time::Instant::now();
    let status = child.terminate(Duration::from_secs(5)).await.unwrap();
    assert!(!status.success());
    // well inside grace + 1s
    assert!(started.elapsed() < Duration::from_secs(6));

    // repeating terminate on a dead child is a no-op returning the status
    let again = child.terminate(Duration::from_secs(1)).await.unwrap();
    assert_eq!(status.code(), again.code());
}

#[tokio::test]
async fn kill_stops_stubborn_children() {
    // traps SIGTERM so only SIGKILL can stop it
    let mut child = spawn(&sh_spec("trap '' TERM; sleep 30")).await.unwrap();

    let started = std::time::Instant::now();
    let status = child.terminate(Duration::from_millis(300)).await.unwrap();
    assert!(!status.success());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn missing_binary_is_a_spawn_error() {
    let spec = SpawnSpec {
        command: "definitely-not-a-real-binary-xyz".to_string(),
        args: vec![],
        cwd: PathBuf::from("/tmp"),
        env: HashMap::new(),
        stdin_payload: None,
    };
    match spawn(&spec).await {
        Err(SpawnError::BinaryNotFound(name)) => {
            assert_eq!(name, "definitely-not-a-real-binary-xyz")
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn missing_cwd_is_a_spawn_error() {
    let mut spec = sh_spec("true");
    spec.cwd = PathBuf::from("/definitely/not/a/dir");
    assert!(matches!(
        spawn(&spec).await,
        Err(SpawnError::WorkingDirMissing(_))
    ));
}

#[test]
fn command_line_splitting_is_shell_style() {
    let spec = SpawnSpec::from_command_line(
        "planner --model 'claude 4' --json",
        PathBuf::from("/tmp"),
        HashMap::new(),
        None,
    )
    .unwrap();
    assert_eq!(spec.command, "planner");
    assert_eq!(spec.args, vec!["--model", "claude 4", "--json"]);

    assert!(matches!(
        SpawnSpec::from_command_line("", PathBuf::from("/tmp"), HashMap::new(), None),
        Err(SpawnError::EmptyCommand)
    ));
}

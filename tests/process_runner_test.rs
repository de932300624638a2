#![cfg(unix)]

// Integration tests for running real child processes

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use worldkeeper::bootstrap::Bootstrap;
use worldkeeper::config::Config;
use worldkeeper::error::KeeperError;
use worldkeeper::process::{CommandSpec, ProcessRunner, Runner};

fn create_test_runner() -> ProcessRunner {
    ProcessRunner::new(Duration::from_secs(2))
}

#[tokio::test]
async fn test_captured_output_and_exit_code() {
    let runner = create_test_runner();
    let command = CommandSpec::new("greet", "/bin/sh")
        .args(["-c", "echo hello; echo oops >&2; echo world"])
        .capture_stdout();

    let output = runner.run(&command).await.unwrap();

    assert_eq!(output.exit_code, Some(0));
    assert_eq!(output.stdout, "hello\nworld\n");
}

#[tokio::test]
async fn test_non_zero_exit_is_command_failure() {
    let runner = create_test_runner();
    let command = CommandSpec::new("fail", "/bin/sh").args(["-c", "exit 3"]);

    match runner.run(&command).await {
        Err(KeeperError::CommandFailed { name, status }) => {
            assert_eq!(name, "fail");
            assert!(status.contains('3'));
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_program_is_spawn_error() {
    let runner = create_test_runner();
    let command = CommandSpec::new("missing", "/nonexistent/worldkeeper-binary");

    assert!(matches!(
        runner.run(&command).await,
        Err(KeeperError::Spawn { .. })
    ));
}

#[tokio::test]
async fn test_cancel_stops_whole_process_group() {
    let runner = create_test_runner();
    let token = CancellationToken::new();
    // The background sleep keeps the pipes open unless the group is signalled
    let command = CommandSpec::new("server", "/bin/sh")
        .args(["-c", "sleep 30 & sleep 30; wait"])
        .cancel_on(token.clone());

    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let result = tokio::time::timeout(Duration::from_secs(10), runner.run(&command))
        .await
        .expect("cancelled command did not stop");

    assert!(matches!(result, Err(KeeperError::Cancelled(_))));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_working_directory_is_applied() {
    let temp_dir = TempDir::new().unwrap();
    std::fs::write(temp_dir.path().join("level.dat"), "world").unwrap();
    let runner = create_test_runner();
    let command = CommandSpec::new("list", "/bin/sh")
        .args(["-c", "cat level.dat"])
        .current_dir(temp_dir.path())
        .capture_stdout();

    let output = runner.run(&command).await.unwrap();
    assert_eq!(output.stdout, "world\n");
}

#[tokio::test]
async fn test_failing_ssh_script_aborts_bootstrap() {
    let temp_dir = TempDir::new().unwrap();
    let env: HashMap<&str, String> = [
        ("WORLD_DATA_REPO", "git@example.com:world.git".to_string()),
        ("SSH_SCRIPT", "/bin/false".to_string()),
        ("START_SCRIPT", "/bin/true".to_string()),
        ("SERVER_JAR", "server.jar".to_string()),
        ("WORK_DIR", temp_dir.path().display().to_string()),
        ("BACKUP_FREQ", "10m".to_string()),
        ("METRICS_PORT", "9090".to_string()),
        ("MINECRAFT_PORT", "25565".to_string()),
    ]
    .into_iter()
    .collect();
    let config = Config::from_lookup(|key| env.get(key).cloned()).unwrap();
    let runner = create_test_runner();

    let result = Bootstrap::new(&runner, &config).prepare().await;

    assert!(matches!(result, Err(KeeperError::Bootstrap(_))));
}

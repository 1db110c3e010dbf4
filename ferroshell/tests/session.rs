//! Local session execution modes.

use std::time::Duration;

use ferroshell::{EngineConfig, Session, SessionBuilder};

fn local_session() -> Session {
    let _ = env_logger::builder().is_test(true).try_init();
    Session::local(EngineConfig {
        local_interval: Duration::from_millis(200),
        local_timeout: Duration::from_secs(10),
        ..EngineConfig::default()
    })
}

#[tokio::test]
async fn test_exec_accumulates_output() {
    let session = local_session();

    let result = session
        .exec("echo a\n# not run\n\necho b >&2\nfalse")
        .await
        .unwrap();
    assert_eq!(result.stdout, "a\n");
    assert_eq!(result.stderr, "b\n");
    assert_eq!(result.exitcode, 1);
}

#[tokio::test]
async fn test_exec_has_no_shared_state() {
    let session = local_session();

    let result = session.exec("cd /\npwd").await.unwrap();
    assert_ne!(result.stdout, "/\n");
}

#[tokio::test]
async fn test_exec_careful_stops_at_failure() {
    let session = local_session();
    session.set_careful(true);

    let err = session
        .exec("echo before\nsh -c 'echo broken >&2; exit 3'\necho never")
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), Some(3));
    assert_eq!(err.to_string(), "broken\n");
}

#[tokio::test]
async fn test_run_script_exit_code() {
    let session = local_session();

    let result = session.run_script("echo start\nexit 7").await.unwrap();
    assert_eq!(result.exitcode, 7);
    assert!(result.stdout.contains("start\n"));
}

#[tokio::test]
async fn test_run_script_shebang_and_state() {
    let session = local_session();

    let result = session
        .run_script("#!/bin/sh\nX=42\necho value=$X")
        .await
        .unwrap();
    assert!(result.stdout.contains("value=42\n"));
    assert_eq!(result.exitcode, 0);
}

#[tokio::test]
async fn test_run_script_careful_final_status() {
    let session = local_session();
    session.set_careful(true);

    let err = session.run_script("exit 4").await.unwrap_err();
    assert_eq!(err.exit_code(), Some(4));
}

#[tokio::test]
async fn test_shell_inherits_careful() {
    let session = SessionBuilder::local()
        .config(EngineConfig {
            local_interval: Duration::from_millis(200),
            ..EngineConfig::default()
        })
        .careful(true)
        .build()
        .await
        .unwrap();

    let shell = session.shell(Some("sh")).await.unwrap();
    assert!(shell.is_careful());
    assert!(shell.run("false").await.is_err());

    shell.set_careful(false);
    assert_eq!(shell.run("false").await.unwrap().exitcode, 1);
    shell.close().await.unwrap();
    session.close().await.unwrap();
}

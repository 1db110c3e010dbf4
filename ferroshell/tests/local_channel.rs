//! Channel behaviour against a real local `sh`.

use std::time::{Duration, Instant};

use ferroshell::error::ConsoleError;
use ferroshell::{
    Channel, Elevation, EngineConfig, Error, ExpectOptions, InteractiveProgram, IterateOptions,
    Prompt, SendOptions, StreamKind,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn test_config() -> EngineConfig {
    EngineConfig {
        local_interval: Duration::from_millis(200),
        local_timeout: Duration::from_secs(10),
        ..EngineConfig::default()
    }
}

async fn open_sh(config: &EngineConfig) -> Channel {
    init_logging();
    Channel::local_with_shell(config, "sh").await.unwrap()
}

#[tokio::test]
async fn test_echo() {
    let channel = open_sh(&test_config()).await;

    let result = channel.run("echo hi").await.unwrap();
    assert_eq!(result.stdout, "hi\n");
    assert_eq!(result.stderr, "");
    assert_eq!(result.exitcode, 0);

    channel.close().await.unwrap();
}

#[tokio::test]
async fn test_echo_without_pty() {
    let config = EngineConfig {
        no_pty: true,
        ..test_config()
    };
    let channel = open_sh(&config).await;

    let result = channel.run("echo hi; echo oops >&2").await.unwrap();
    assert_eq!(result.stdout, "hi\n");
    assert_eq!(result.stderr, "oops\n");
    assert_eq!(result.exitcode, 0);

    channel.close().await.unwrap();
}

#[tokio::test]
async fn test_no_leakage_between_commands() {
    let channel = open_sh(&test_config()).await;

    let first = channel.run("echo one").await.unwrap();
    let second = channel.run("echo two").await.unwrap();
    assert_eq!(first.stdout, "one\n");
    assert_eq!(second.stdout, "two\n");

    // The transcript keeps everything except the exit-code markers
    let transcript = channel.close().await.unwrap();
    assert!(transcript.stdout.contains("one\n"));
    assert!(transcript.stdout.contains("two\n"));
    assert!(!transcript.stdout.contains("__exitcode"));
}

#[tokio::test]
async fn test_shell_state_persists() {
    let channel = open_sh(&test_config()).await;

    channel.run("GREETING=hello").await.unwrap();
    let result = channel.run("echo $GREETING").await.unwrap();
    assert_eq!(result.stdout, "hello\n");

    channel.close().await.unwrap();
}

#[tokio::test]
async fn test_exit_code_of_failed_command() {
    let channel = open_sh(&test_config()).await;

    let result = channel.run("false").await.unwrap();
    assert_eq!(result.exitcode, 1);
    assert_eq!(channel.exitcode(), 1);

    channel.close().await.unwrap();
}

#[tokio::test]
async fn test_exit_code_of_exiting_shell() {
    let channel = open_sh(&test_config()).await;

    assert_eq!(channel.run("true").await.unwrap().exitcode, 0);
    let result = channel.run("exit 7").await.unwrap();
    assert_eq!(result.exitcode, 7);
    assert_eq!(channel.exitcode(), 7);

    let transcript = channel.close().await.unwrap();
    assert_eq!(transcript.exitcode, 7);
}

#[tokio::test]
async fn test_careful_exit_raises_at_completion() {
    let channel = open_sh(&test_config()).await;
    channel.set_careful(true);

    let err = channel.run("exit 7").await.unwrap_err();
    assert_eq!(err.exit_code(), Some(7));

    channel.set_careful(false);
    channel.close().await.unwrap();
}

#[tokio::test]
async fn test_careful_mode_raises() {
    let channel = open_sh(&test_config()).await;
    channel.set_careful(true);

    let err = channel.run("ls /definitely/not/here").await.unwrap_err();
    assert!(err.exit_code().is_some_and(|code| code > 0));
    assert!(!err.to_string().is_empty());

    // The channel stays usable after a careful failure
    let result = channel.run("echo still here").await.unwrap();
    assert_eq!(result.stdout, "still here\n");

    channel.close().await.unwrap();
}

#[tokio::test]
async fn test_multi_line_block() {
    let channel = open_sh(&test_config()).await;

    let result = channel
        .sendline("echo a\n\n   echo b", SendOptions::new())
        .await
        .unwrap();
    assert_eq!(result.stdout, "a\nb\n");
    assert_eq!(result.exitcode, 0);

    channel.close().await.unwrap();
}

#[tokio::test]
async fn test_careful_stops_multi_line_block() {
    let channel = open_sh(&test_config()).await;
    channel.set_careful(true);

    let err = channel
        .sendline("false\necho never", SendOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), Some(1));

    channel.set_careful(false);
    let transcript = channel.close().await.unwrap();
    assert!(!transcript.stdout.contains("never"));
}

#[tokio::test]
async fn test_never_ending_output_only_reaches_follower() {
    let channel = open_sh(&test_config()).await;

    let started = Instant::now();
    let result = channel
        .sendline(
            "sleep 0.5; for i in 1 2 3; do echo tick$i; sleep 0.1; done",
            SendOptions::new().never_ending(),
        )
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(400));
    assert_eq!(result.stdout, "");

    let mut stream = channel
        .follow(
            IterateOptions::new()
                .no_terminator()
                .line_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    let mut lines = Vec::new();
    for _ in 0..3 {
        lines.push(stream.next_line().await.unwrap().unwrap().text);
    }
    assert_eq!(lines, vec!["tick1", "tick2", "tick3"]);
    let finished = stream.finish().await.unwrap();
    assert_eq!(finished.stdout, "");

    let result = channel.run("echo after").await.unwrap();
    assert_eq!(result.stdout, "after\n");

    channel.close().await.unwrap();
}

#[tokio::test]
async fn test_prompt_armed_completion() {
    init_logging();
    let channel = Channel::local_with_shell(&test_config(), "sh -i")
        .await
        .unwrap();
    channel.run("PS1='ready> '").await.unwrap();
    channel
        .set_prompt(Prompt::literal("ready>", StreamKind::Stderr).unwrap(), true)
        .await;

    // Quiet for longer than the quiescence interval; only the prompt ends it
    let result = channel.run("sleep 1; echo two").await.unwrap();
    assert_eq!(result.stdout, "two\n");
    assert_eq!(result.exitcode, 0);
    let first = channel.prompt_state().await.prompt.position();
    assert!(first > 0);

    let result = channel.run("echo three").await.unwrap();
    assert_eq!(result.stdout, "three\n");
    let second = channel.prompt_state().await.prompt.position();
    assert!(second > first);

    channel.close().await.unwrap();
}

#[tokio::test]
async fn test_wait_for_quiescence() {
    let channel = open_sh(&test_config()).await;

    channel.send("sleep 0.3; echo done\n").await.unwrap();
    let started = Instant::now();
    let found = channel
        .expect(&["done"], ExpectOptions::new().timeout(Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(found.is_some());
    assert!(started.elapsed() >= Duration::from_millis(200));

    let started = Instant::now();
    channel
        .wait(Duration::from_millis(300), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    // Quiescence counts from the last output, which arrived just before
    assert!(started.elapsed() >= Duration::from_millis(250));

    channel.close().await.unwrap();
}

#[tokio::test]
async fn test_wait_times_out_on_busy_output() {
    let channel = open_sh(&test_config()).await;

    channel
        .send("for i in 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20; do echo x; sleep 0.1; done\n")
        .await
        .unwrap();
    let err = channel
        .wait(Duration::from_millis(500), Some(Duration::from_millis(800)))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    // Let the loop run out before closing
    channel
        .wait(Duration::from_millis(500), Some(Duration::from_secs(10)))
        .await
        .unwrap();
    channel.close().await.unwrap();
}

#[tokio::test]
async fn test_expect_silent_timeout() {
    let channel = open_sh(&test_config()).await;

    let found = channel
        .expect(
            &["never printed"],
            ExpectOptions::new()
                .timeout(Duration::from_millis(200))
                .silent(),
        )
        .await
        .unwrap();
    assert!(found.is_none());

    let err = channel
        .expect(
            &["never printed"],
            ExpectOptions::new().timeout(Duration::from_millis(200)),
        )
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    channel.close().await.unwrap();
}

#[tokio::test]
async fn test_iterate_lines() {
    let channel = open_sh(&test_config()).await;

    let options = IterateOptions::new()
        .no_terminator()
        .line_timeout(Duration::from_secs(5));
    let mut stream = channel
        .iterate("for i in 1 2 3; do echo line$i; sleep 0.1; done", options)
        .await
        .unwrap();

    let mut lines = Vec::new();
    for _ in 0..3 {
        let line = stream.next_line().await.unwrap().unwrap();
        lines.push(line.text);
    }
    assert_eq!(lines, vec!["line1", "line2", "line3"]);
    stream.finish().await.unwrap();

    // Normal commands work again afterwards
    let result = channel.run("echo after").await.unwrap();
    assert_eq!(result.stdout, "after\n");
    assert_eq!(result.exitcode, 0);

    channel.close().await.unwrap();
}

#[tokio::test]
async fn test_iterate_line_timeout() {
    let channel = open_sh(&test_config()).await;

    let options = IterateOptions::new()
        .no_terminator()
        .line_timeout(Duration::from_millis(300));
    let mut stream = channel.iterate("sleep 1", options).await.unwrap();
    let err = stream.next_line().await.unwrap_err();
    assert!(err.is_timeout());
    stream.finish().await.unwrap();

    channel.close().await.unwrap();
}

#[tokio::test]
async fn test_iterate_defaults_to_command_timeout() {
    let config = EngineConfig {
        local_timeout: Duration::from_millis(500),
        ..test_config()
    };
    let channel = open_sh(&config).await;

    let started = Instant::now();
    let mut stream = channel
        .iterate("sleep 2", IterateOptions::new().no_terminator())
        .await
        .unwrap();
    let err = stream.next_line().await.unwrap_err();
    assert!(err.is_timeout());
    assert!(started.elapsed() < Duration::from_millis(1500));
    stream.finish().await.unwrap();

    channel.close().await.unwrap();
}

#[tokio::test]
async fn test_close_while_streaming_times_out() {
    let config = EngineConfig {
        local_timeout: Duration::from_millis(500),
        ..test_config()
    };
    let channel = open_sh(&config).await;

    let stream = channel
        .iterate("sleep 0.2", IterateOptions::new().no_terminator())
        .await
        .unwrap();
    let err = channel.close().await.unwrap_err();
    assert!(err.is_timeout());
    assert!(!channel.is_closed());

    stream.finish().await.unwrap();
    channel.close().await.unwrap();
    assert!(channel.is_closed());
}

const FAKE_REPL: &str = r#"sh -c 'printf "token: "; read t; if [ "$t" != open ]; then echo "bad token"; exit 1; fi; printf "repl> "; while read line && [ "$line" != quit ]; do echo "got $line"; printf "repl> "; done'"#;

fn repl(token: &str) -> InteractiveProgram {
    InteractiveProgram::new(FAKE_REPL)
        .expect("token:")
        .input(token)
        .failure_patterns(["bad token"])
        .prompt("repl>")
        .terminator("quit\n")
}

#[tokio::test]
async fn test_enter_interactive_program() {
    let channel = open_sh(&test_config()).await;

    let console = channel.enter(repl("open")).await.unwrap();
    assert_eq!(console.depth().await, 1);

    let result = console.sendline("hello", SendOptions::new()).await.unwrap();
    assert!(result.stdout.contains("got hello\n"));

    let left = console.exit().await.unwrap();
    assert_eq!(left.exitcode, 0);
    assert_eq!(channel.depth().await, 0);

    let result = channel.run("echo outer").await.unwrap();
    assert_eq!(result.stdout, "outer\n");

    channel.close().await.unwrap();
}

#[tokio::test]
async fn test_enter_refused_input() {
    let channel = open_sh(&test_config()).await;

    let err = channel.enter(repl("closed")).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Console(ConsoleError::LoginFailed { .. })
    ));
    assert_eq!(channel.depth().await, 0);

    let result = channel.run("echo outer").await.unwrap();
    assert_eq!(result.stdout, "outer\n");

    channel.close().await.unwrap();
}

#[tokio::test]
async fn test_enter_not_ready() {
    let channel = open_sh(&test_config()).await;

    let program = InteractiveProgram::new("true")
        .expect("never shown")
        .ready_timeout(Duration::from_millis(300));
    let err = channel.enter(program).await.unwrap_err();
    assert!(matches!(err, Error::Console(ConsoleError::NotReady { .. })));
    assert_eq!(channel.depth().await, 0);

    assert_eq!(channel.run("true").await.unwrap().exitcode, 0);
    channel.close().await.unwrap();
}

const FAKE_LOGIN: &str = r#"sh -c 'printf "Password: "; read pw; if [ "$pw" = right ]; then exec sh; fi; echo "sorry, try again"; exit 1'"#;

#[tokio::test]
async fn test_nested_console_wrong_credential() {
    let channel = open_sh(&test_config()).await;

    let err = channel
        .subshell_with(FAKE_LOGIN, Elevation::new().password("wrong"), true)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Console(ConsoleError::LoginFailed { .. })
    ));
    assert_eq!(channel.depth().await, 0);

    let result = channel.run("echo outer").await.unwrap();
    assert_eq!(result.stdout, "outer\n");

    channel.close().await.unwrap();
}

#[tokio::test]
async fn test_nested_console_missing_credential() {
    let channel = open_sh(&test_config()).await;

    let err = channel
        .subshell_with(FAKE_LOGIN, Elevation::new(), true)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Console(ConsoleError::PasswordRequired { .. })
    ));
    assert_eq!(channel.depth().await, 0);

    // Unblock the fake login so the shell can close
    channel.send("nothing\n").await.unwrap();
    channel.close().await.unwrap();
}

#[tokio::test]
async fn test_nested_console_right_credential() {
    let channel = open_sh(&test_config()).await;

    let console = channel
        .subshell_with(FAKE_LOGIN, Elevation::new().password("right"), true)
        .await
        .unwrap();
    assert_eq!(console.depth().await, 1);

    let result = console.run("echo inner").await.unwrap();
    assert_eq!(result.stdout, "inner\n");
    assert_eq!(result.exitcode, 0);

    let left = console.exit().await.unwrap();
    assert_eq!(left.exitcode, 0);
    assert_eq!(channel.depth().await, 0);

    let result = channel.run("echo outer").await.unwrap();
    assert_eq!(result.stdout, "outer\n");

    channel.close().await.unwrap();
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let channel = open_sh(&test_config()).await;
    channel.run("echo once").await.unwrap();

    let first = channel.close().await.unwrap();
    let second = channel.close().await.unwrap();
    assert_eq!(first, second);
    assert!(channel.is_closed());
    assert!(channel.run("echo again").await.is_err());
}

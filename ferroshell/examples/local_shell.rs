//! Local example: drive a persistent shell on this machine
//!
//! Runs a few commands in one shell (so `cd` and variables carry over),
//! shows exit codes, careful mode and streaming a command's output.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example local_shell
//! cargo run --example local_shell -- --shell /bin/sh --interval 0.2 --verbose
//! ```

use std::env;
use std::time::Duration;

use ferroshell::{EngineConfig, IterateOptions, SessionBuilder};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging (set RUST_LOG=debug for verbose output)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut config = EngineConfig::from_env()?;
    config.local_interval = Duration::from_secs_f64(args.interval);
    config.verbose |= args.verbose;

    let session = SessionBuilder::local().config(config).build().await?;

    // One-shot execution: every line is its own process
    let result = session.exec("uname -s\nid -un").await?;
    println!("exec:\n{}", result.stdout.trim_end());

    // Persistent shell
    let shell = session.shell(args.shell.as_deref()).await?;
    println!("\nShell opened");

    shell.run("cd /tmp").await?;
    let result = shell.run("pwd").await?;
    println!("Current directory: {}", result.stdout.trim());

    let result = shell.run("ls /nonexistent").await?;
    println!(
        "ls /nonexistent exited {} ({})",
        result.exitcode,
        result.stderr.trim()
    );

    shell.set_careful(true);
    match shell.run("false").await {
        Ok(_) => println!("false succeeded?"),
        Err(e) => println!("careful mode caught exit code {:?}", e.exit_code()),
    }
    shell.set_careful(false);

    // Streaming
    println!("\nStreaming a slow counter:");
    let options = IterateOptions::new()
        .no_terminator()
        .line_timeout(Duration::from_secs(5));
    let mut stream = shell
        .iterate("for i in 1 2 3 4 5; do echo tick $i; sleep 0.2; done", options)
        .await?;
    for _ in 0..5 {
        match stream.next_line().await? {
            Some(line) => println!("  {}", line.text),
            None => break,
        }
    }
    stream.finish().await?;

    let transcript = shell.close().await?;
    println!("\nShell closed with exit code {}", transcript.exitcode);
    println!("Transcript is {} bytes", transcript.stdout.len());

    Ok(())
}

/// Simple argument parser (avoiding external dependencies)
struct Args {
    shell: Option<String>,
    interval: f64,
    verbose: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = env::args().collect();
        let mut shell = None;
        let mut interval = 0.5f64;
        let mut verbose = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--shell" | "-s" => {
                    i += 1;
                    if i < args.len() {
                        shell = Some(args[i].clone());
                    }
                }
                "--interval" | "-i" => {
                    i += 1;
                    if i < args.len() {
                        interval = args[i].parse().unwrap_or(0.5);
                    }
                }
                "--verbose" | "-v" => verbose = true,
                "--help" => {
                    Self::print_help();
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", args[i]);
                }
            }
            i += 1;
        }

        Self {
            shell,
            interval,
            verbose,
        }
    }

    fn print_help() {
        println!(
            r#"ferroshell local_shell example

USAGE:
    cargo run --example local_shell -- [OPTIONS]

OPTIONS:
    -s, --shell <CMD>        Shell command line [default: $SHELL or bash]
    -i, --interval <SECS>    Quiescence interval [default: 0.5]
    -v, --verbose            Echo output lines as they arrive
    --help                   Print this help message
"#
        );
    }
}

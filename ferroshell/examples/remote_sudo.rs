//! Remote example: run commands over SSH and as root through sudo
//!
//! # Prerequisites
//!
//! - SSH server reachable on the target host
//! - A user allowed to run `sudo` (the SSH password is reused for sudo)
//!
//! # Usage
//!
//! With password authentication:
//! ```bash
//! cargo run --example remote_sudo -- --host localhost --user admin --password secret
//! ```
//!
//! With SSH key authentication (sudo password given separately):
//! ```bash
//! cargo run --example remote_sudo -- --host 192.168.1.1 --user admin --key ~/.ssh/id_ed25519 --sudo-password secret
//! ```

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use ferroshell::{Elevation, HostKeyVerification, SessionBuilder};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging (set RUST_LOG=debug for verbose output)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    println!("Connecting to {}:{}...", args.host, args.port);

    let mut builder = SessionBuilder::remote(&args.host)
        .port(args.port)
        .username(&args.user)
        .timeout(Duration::from_secs(args.timeout));
    if args.insecure {
        builder = builder.host_key_verification(HostKeyVerification::Disabled);
    }

    // Set authentication method
    if let Some(password) = &args.password {
        builder = builder.password(password);
    } else if let Some(key_path) = &args.key {
        builder = builder.private_key(key_path);
    } else {
        eprintln!("Error: Must provide either --password or --key");
        std::process::exit(1);
    }

    let session = builder.build().await?;
    println!("Connected!");

    // One-shot remote execution (no pty, separate stderr)
    let result = session.exec("hostname\nuptime").await?;
    println!("{}", result.stdout.trim_end());

    let shell = session.shell(None).await?;
    let result = shell.run("whoami").await?;
    println!("\nLogged in as: {}", result.stdout.trim());

    let sudo_password = args.sudo_password.or(args.password);
    let mut elevation = Elevation::new();
    if let Some(password) = sudo_password {
        elevation = elevation.password(password);
    }

    println!("Entering sudo...");
    match shell.sudo(elevation).await {
        Ok(root) => {
            let result = root.run("whoami").await?;
            println!("Inside sudo as: {}", result.stdout.trim());

            let result = root.run("id -u").await?;
            println!("uid {} (exit {})", result.stdout.trim(), result.exitcode);

            root.exit().await?;
            println!("Left sudo");
        }
        Err(e) => eprintln!("sudo failed: {}", e),
    }

    let result = shell.run("whoami").await?;
    println!("Back as: {}", result.stdout.trim());

    shell.close().await?;
    session.close().await?;
    println!("Done!");

    Ok(())
}

/// Simple argument parser (avoiding external dependencies)
struct Args {
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
    key: Option<PathBuf>,
    sudo_password: Option<String>,
    timeout: u64,
    insecure: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = env::args().collect();
        let mut host = "localhost".to_string();
        let mut port = 22u16;
        let mut user = env::var("USER").unwrap_or_else(|_| "root".to_string());
        let mut password = None;
        let mut key = None;
        let mut sudo_password = None;
        let mut timeout = 30u64;
        let mut insecure = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--host" | "-h" => {
                    i += 1;
                    if i < args.len() {
                        host = args[i].clone();
                    }
                }
                "--port" | "-p" => {
                    i += 1;
                    if i < args.len() {
                        port = args[i].parse().unwrap_or(22);
                    }
                }
                "--user" | "-u" => {
                    i += 1;
                    if i < args.len() {
                        user = args[i].clone();
                    }
                }
                "--password" | "-P" => {
                    i += 1;
                    if i < args.len() {
                        password = Some(args[i].clone());
                    }
                }
                "--key" | "-k" => {
                    i += 1;
                    if i < args.len() {
                        key = Some(PathBuf::from(&args[i]));
                    }
                }
                "--sudo-password" => {
                    i += 1;
                    if i < args.len() {
                        sudo_password = Some(args[i].clone());
                    }
                }
                "--timeout" | "-t" => {
                    i += 1;
                    if i < args.len() {
                        timeout = args[i].parse().unwrap_or(30);
                    }
                }
                "--insecure" => insecure = true,
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
            host,
            port,
            user,
            password,
            key,
            sudo_password,
            timeout,
            insecure,
        }
    }

    fn print_help() {
        println!(
            r#"ferroshell remote_sudo example

USAGE:
    cargo run --example remote_sudo -- [OPTIONS]

OPTIONS:
    -h, --host <HOST>          Target host [default: localhost]
    -p, --port <PORT>          SSH port [default: 22]
    -u, --user <USER>          Username [default: $USER]
    -P, --password <PASS>      Password for authentication (and sudo)
    -k, --key <PATH>           Path to SSH private key
    --sudo-password <PASS>     Password for sudo [default: --password]
    -t, --timeout <SECS>       Connection timeout [default: 30]
    --insecure                 Skip host key verification
    --help                     Print this help message
"#
        );
    }
}

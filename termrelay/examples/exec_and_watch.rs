//! Execute commands on a session while watching its terminal live.
//!
//! Connects to a host, attaches a monitor that prints every history
//! chunk as it arrives, then runs a few commands. The monitor sees the
//! same byte stream the executor resolves commands from: prompt, echo,
//! output, prompt — each exactly once.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example exec_and_watch -- --host localhost --user your_username --password your_password
//! ```

use std::env;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use futures_util::StreamExt;
use termrelay::{MonitorEvent, SessionConfig, SessionRegistry, SshConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging (set RUST_LOG=debug for verbose output)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut ssh = SshConfig::new(&args.host, &args.user)
        .port(args.port)
        .timeout(Duration::from_secs(args.timeout));

    if let Some(password) = &args.password {
        ssh = ssh.password(password.clone());
    } else if let Some(key_path) = &args.key {
        ssh = ssh.private_key(key_path.clone());
    } else {
        eprintln!("Error: Must provide either --password or --key");
        std::process::exit(1);
    }

    let registry = SessionRegistry::new();

    println!("Connecting to {}:{}...", args.host, args.port);
    registry.connect("demo", SessionConfig::new(ssh)).await?;
    println!("Connected!\n");

    // Watch the session's terminal from a second consumer. The attach
    // replays everything recorded so far, then streams live chunks.
    let mut monitor = registry.attach_monitor("demo").await?;
    let watcher = tokio::spawn(async move {
        while let Some(event) = monitor.next().await {
            match event {
                MonitorEvent::Chunk(chunk) => {
                    print!("{}", String::from_utf8_lossy(&chunk.bytes));
                    std::io::stdout().flush().ok();
                }
                MonitorEvent::Closed { error } => {
                    if let Some(e) = error {
                        eprintln!("\n[monitor] session failed: {}", e);
                    } else {
                        println!("\n[monitor] session closed");
                    }
                    break;
                }
            }
        }
    });

    for command in ["pwd", "whoami", "echo \"testing terminal fix\""] {
        let outcome = registry.exec("demo", command, None).await?;
        println!(
            "\n[exec] {:?} -> exit {:?} in {}ms: {}",
            command,
            outcome.exit_code,
            outcome.duration_ms(),
            outcome.stdout.trim_end()
        );
    }

    registry.disconnect("demo").await?;
    watcher.await?;
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
    timeout: u64,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = env::args().collect();
        let mut host = "localhost".to_string();
        let mut port = 22u16;
        let mut user = env::var("USER").unwrap_or_else(|_| "root".to_string());
        let mut password = None;
        let mut key = None;
        let mut timeout = 30u64;

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
                "--timeout" | "-t" => {
                    i += 1;
                    if i < args.len() {
                        timeout = args[i].parse().unwrap_or(30);
                    }
                }
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
            timeout,
        }
    }

    fn print_help() {
        println!(
            r#"termrelay exec_and_watch example

USAGE:
    cargo run --example exec_and_watch -- [OPTIONS]

OPTIONS:
    -h, --host <HOST>        Target host [default: localhost]
    -p, --port <PORT>        SSH port [default: 22]
    -u, --user <USER>        Username [default: $USER]
    -P, --password <PASS>    Password for authentication
    -k, --key <PATH>         Path to SSH private key
    -t, --timeout <SECS>     Connection timeout [default: 30]
    --help                   Print this help message
"#
        );
    }
}

//! Non-Interactive Command Execution Example
//!
//! Connects to an SSH server, authenticates with a password and runs each
//! command on its own session channel, similar to `ssh user@host command`.
//!
//! Usage:
//!   cargo run --example exec_command <host:port> <username> <password> <command1> [command2] [...]
//!
//! Example:
//!   RUST_LOG=kestrel_proto=debug cargo run --example exec_command 127.0.0.1:2222 admin secret "whoami" "uname -a"

use kestrel_proto::ssh::auth::{authenticate_password, AuthStatus};
use kestrel_proto::ssh::{Session, SessionConfig};
use std::env;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Run one command and print what it produced
async fn run(session: &Session, command: &str) -> bool {
    println!("$ {}", command);
    match session.execute(command).await {
        Ok(output) => {
            print!("{}", String::from_utf8_lossy(&output.stdout));
            eprint!("{}", String::from_utf8_lossy(&output.stderr));
            match (output.exit_status, output.exit_signal) {
                (Some(0), _) => true,
                (Some(code), _) => {
                    eprintln!("exit status {}", code);
                    false
                }
                (None, Some(signal)) => {
                    eprintln!("killed by signal {}", signal);
                    false
                }
                (None, None) => true,
            }
        }
        Err(e) => {
            eprintln!("Error executing command: {}", e);
            false
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 5 {
        eprintln!(
            "Usage: {} <host:port> <username> <password> <command1> [command2] [...]",
            args[0]
        );
        std::process::exit(1);
    }
    let server_addr = &args[1];
    let username = &args[2];
    let password = &args[3];
    let commands = &args[4..];

    let config = SessionConfig::builder()
        .with_host_key_callback(|info| {
            println!("Host key: {} {}", info.algorithm, info.fingerprint);
            true
        })
        .with_keepalive(Duration::from_secs(30))
        .build()?;

    println!("Connecting to {}...", server_addr);
    let session = Session::connect_tcp(server_addr.as_str(), config).await?;
    println!("Connected to {}", session.server_version());
    if let Some(algorithms) = session.algorithms() {
        println!(
            "  kex={} cipher={} mac={}",
            algorithms.kex, algorithms.cipher_c2s, algorithms.mac_c2s
        );
    }

    let reply = authenticate_password(&session, username, password).await?;
    for banner in &reply.banners {
        print!("{}", banner);
    }
    match reply.status {
        AuthStatus::Success => println!("Authenticated as '{}'", username),
        AuthStatus::Failure { methods, .. } => {
            eprintln!("Authentication failed; server accepts: {}", methods.join(","));
            session.disconnect().await?;
            std::process::exit(1);
        }
        AuthStatus::PasswordChangeRequired { prompt } => {
            eprintln!("Password change required: {}", prompt);
            session.disconnect().await?;
            std::process::exit(1);
        }
    }
    println!();

    let mut failures = 0;
    for command in commands {
        if !run(&session, command).await {
            failures += 1;
        }
    }

    println!();
    println!(
        "{} command(s), {} failed",
        commands.len(),
        failures
    );
    session.disconnect().await?;

    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}

//! NimbusKV CLI Client
//!
//! Command-line interface for running commands against a NimbusKV cluster.

use std::time::Duration;

use clap::{Parser, Subcommand};
use crossbeam::channel::Receiver;
use tracing_subscriber::{fmt, EnvFilter};

use nimbuskv::{
    Cluster, ClusterConfig, DeleteCommand, FetchCommand, ListKeysCommand, NimbusError,
    PingCommand, PutCommand, SelectorKind,
};

/// NimbusKV CLI
#[derive(Parser, Debug)]
#[command(name = "nimbuskv-cli")]
#[command(about = "CLI for NimbusKV key-value clusters")]
#[command(version)]
struct Args {
    /// Server address (host:port); repeat for multiple nodes
    #[arg(short, long, default_value = "127.0.0.1:8087")]
    server: Vec<String>,

    /// Execution attempts per command, the first included
    #[arg(long, default_value = "3")]
    attempts: u32,

    /// Node selection strategy: round-robin or least-executing
    #[arg(long, default_value = "round-robin")]
    selector: String,

    /// Seconds to wait for a command's result
    #[arg(long, default_value = "30")]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a value by key
    Get {
        /// The key to get
        key: String,
    },

    /// Set a key-value pair
    Set {
        /// The key to set
        key: String,

        /// The value to set
        value: String,
    },

    /// Delete a key
    Del {
        /// The key to delete
        key: String,
    },

    /// List every key on a node
    Keys,

    /// Ping a node
    Ping,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,nimbuskv=info"));

    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();

    let selector = match args.selector.as_str() {
        "round-robin" => SelectorKind::RoundRobin,
        "least-executing" => SelectorKind::LeastExecuting,
        other => {
            eprintln!("unknown selector: {other}");
            std::process::exit(2);
        }
    };

    let mut builder = ClusterConfig::builder()
        .execution_attempts(args.attempts)
        .selector(selector);
    for addr in &args.server {
        builder = builder.node_addr(addr);
    }

    let cluster = match Cluster::new(builder.build()) {
        Ok(cluster) => cluster,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = cluster.start() {
        eprintln!("failed to start cluster: {e}");
        std::process::exit(1);
    }

    let timeout = Duration::from_secs(args.timeout_secs);
    let outcome = run_command(&cluster, args.command, timeout);

    let _ = cluster.stop();
    cluster.await_shutdown(Duration::from_secs(5));

    if let Err(e) = outcome {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run_command(cluster: &Cluster, command: Commands, timeout: Duration) -> nimbuskv::Result<()> {
    match command {
        Commands::Get { key } => {
            let (cmd, rx) = FetchCommand::new(key);
            cluster.execute(cmd)?;
            match wait(&rx, timeout)? {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => println!("(nil)"),
            }
        }
        Commands::Set { key, value } => {
            let (cmd, rx) = PutCommand::new(key, value);
            cluster.execute(cmd)?;
            wait(&rx, timeout)?;
            println!("OK");
        }
        Commands::Del { key } => {
            let (cmd, rx) = DeleteCommand::new(key);
            cluster.execute(cmd)?;
            wait(&rx, timeout)?;
            println!("OK");
        }
        Commands::Keys => {
            let (cmd, rx) = ListKeysCommand::new();
            cluster.execute(cmd)?;
            for key in wait(&rx, timeout)? {
                println!("{}", String::from_utf8_lossy(&key));
            }
        }
        Commands::Ping => {
            let (cmd, rx) = PingCommand::new();
            cluster.execute(cmd)?;
            wait(&rx, timeout)?;
            println!("PONG");
        }
    }
    Ok(())
}

/// Block for a command's terminal outcome
fn wait<T>(rx: &Receiver<nimbuskv::Result<T>>, timeout: Duration) -> nimbuskv::Result<T> {
    match rx.recv_timeout(timeout) {
        Ok(outcome) => outcome,
        Err(_) => Err(NimbusError::Connection(
            "timed out waiting for a result".to_string(),
        )),
    }
}

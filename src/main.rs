//! sandterm - sandboxed terminals over WebSocket.
//!
//! Usage:
//!   sandterm serve [--port 8080] [--runtime docker|isolate] ...
//!   sandterm enter --root R --cgroup C -- <shell>   # internal, isolate runtime

use clap::{Parser, Subcommand};
use sandterm::config::{Config, RuntimeKind, ServeArgs};
use sandterm::http_server;
use sandterm::sandbox::isolate::{self, EnterArgs};
use sandterm::AppState;
use std::process::exit;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sandterm")]
#[command(about = "Sandboxed interactive terminals over WebSocket")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the terminal server
    Serve(ServeArgs),

    /// Enter a prepared isolate sandbox and exec a shell
    #[command(hide = true)]
    Enter(EnterArgs),
}

fn main() {
    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => {
            init_tracing();
            let config = match Config::try_from(serve_args) {
                Ok(config) => config,
                Err(e) => {
                    error!("Invalid configuration: {}", e);
                    exit(2);
                }
            };
            exit(serve(config));
        }
        // Runs on a pty in place of the shell: no tracing output, errors
        // go to the terminal itself.
        Commands::Enter(enter_args) => match isolate::enter(&enter_args) {
            Ok(code) => exit(code),
            Err(e) => {
                eprintln!("sandbox: {}", e);
                exit(127);
            }
        },
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sandterm=info,tower_http=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn serve(config: Config) -> i32 {
    // The isolate runtime mounts filesystems and writes cgroups
    if config.runtime == RuntimeKind::Isolate && !nix::unistd::geteuid().is_root() {
        error!("Must run as root for the isolate runtime (need CAP_SYS_ADMIN for namespaces)");
        return 1;
    }

    let runtime = match config.build_runtime() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to set up sandbox runtime: {}", e);
            return 1;
        }
    };
    let ledger = match config.build_ledger() {
        Ok(ledger) => ledger,
        Err(e) => {
            error!("Failed to set up ledger: {}", e);
            return 1;
        }
    };

    let tokio_runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to start async runtime: {}", e);
            return 1;
        }
    };

    let listen = config.listen;
    let state = AppState::new(config, runtime, ledger);
    match tokio_runtime.block_on(http_server::run_server(listen, state)) {
        Ok(()) => {
            info!("Server stopped");
            0
        }
        Err(e) => {
            error!("Server error: {}", e);
            1
        }
    }
}

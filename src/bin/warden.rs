use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use warden::config::{self, Config};
use warden::protocol::{Dispatch, Message, Unhandled};
use warden::{Client, Endpoint, MemoryMonitor, Server, Worker};

#[derive(Parser, Debug)]
#[command(
    name = "warden",
    version,
    about = "Local process supervisor",
    arg_required_else_help = true
)]
struct Cli {
    /// Socket path (overrides config).
    #[arg(long, global = true, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Config file (default: ./warden.toml).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the supervisor in the foreground.
    Serve,
    /// Ask the running supervisor for fleet status.
    Status,
    /// Ask the running supervisor to signal its process group and restart.
    Restart {
        /// Signal name, e.g. INT, TERM, HUP (default: INT).
        #[arg(long)]
        signal: Option<String>,
    },
    /// Run a bare worker attached to the supervisor, for manual testing.
    Worker,
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = config::load_or_default(cli.config.as_deref());
    if let Some(socket) = cli.socket {
        config.socket_path = socket;
    }

    if let Err(e) = run(cli.command, config) {
        tracing::error!("error: {e}");
        std::process::exit(1);
    }
}

fn run(command: Command, config: Config) -> warden::Result<()> {
    let endpoint = Endpoint::unix(&config.socket_path);
    match command {
        Command::Serve => {
            let server = Arc::new(
                Server::new(endpoint)
                    .with_monitor(Arc::new(MemoryMonitor::from_config(&config.memory))),
            );
            server.run()?;
            Ok(())
        }
        Command::Status => {
            let connection = control_connection(endpoint)?;
            connection.call_stream(Message::request("status"), Some(config.call_timeout()), |frame| {
                match serde_json::to_string(&frame) {
                    Ok(line) => println!("{line}"),
                    Err(e) => tracing::warn!("unprintable frame: {e}"),
                }
            })?;
            Ok(())
        }
        Command::Restart { signal } => {
            let connection = control_connection(endpoint)?;
            let mut request = Message::request("restart");
            if let Some(signal) = signal {
                request.set("signal", signal);
            }
            let response = connection.call(request, Some(config.call_timeout()))?;
            match serde_json::to_string(&response) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!("unprintable frame: {e}"),
            }
            Ok(())
        }
        Command::Worker => {
            let worker = Arc::new(Worker::new(endpoint));
            worker.run();
            Ok(())
        }
    }
}

fn control_connection(
    endpoint: Endpoint,
) -> Result<Arc<warden::Connection>, warden::protocol::ProtocolError> {
    let client = Client::new(endpoint);
    let target: Arc<dyn Dispatch> = Arc::new(Unhandled);
    client.connect_background(&target)
}

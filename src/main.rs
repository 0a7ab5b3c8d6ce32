use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use syng::client::{run_client, ClientOptions};
use syng::config::{ConfigFile, LogLevel};
use syng::errors::{AppError, AppResult};
use syng::server::{RelayServer, ServerOptions};

#[derive(Parser)]
#[command(name = "syng")]
#[command(version)]
#[command(about = "A networked karaoke system with pluggable media sources")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Action>,
}

#[derive(Subcommand)]
enum Action {
    /// Run the venue-side playback client
    Client {
        /// Room code to (re)claim
        #[arg(short, long)]
        room: Option<String>,

        /// Admin-equivalent shared secret for the room
        #[arg(short, long)]
        secret: Option<String>,

        /// Configuration file path
        #[arg(short = 'C', long, default_value = "syng-client.yaml")]
        config_file: PathBuf,

        /// Registration key, when the relay requires one
        #[arg(short, long)]
        key: Option<String>,

        /// Relay server URL
        #[arg(short = 'S', long)]
        server: Option<String>,
    },
    /// Run the relay server
    Server {
        /// Listening address
        #[arg(short = 'H', long, default_value = "localhost")]
        host: String,

        /// Listening port
        #[arg(short, long, default_value_t = 8080)]
        port: u16,

        /// Serve the web UI from this folder instead of the embedded bundle
        #[arg(short, long)]
        root_folder: Option<PathBuf>,

        /// Only accept playback clients carrying a key from this file
        #[arg(short = 'k', long)]
        registration_keyfile: Option<PathBuf>,
    },
    /// Run the desktop GUI shell
    Gui,
}

fn init_tracing(level: LogLevel) {
    let filter = format!("syng={}", level.as_filter());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(cli: Cli) -> AppResult<()> {
    match cli.command {
        Some(Action::Client {
            room,
            secret,
            config_file,
            key,
            server,
        }) => {
            let level = ConfigFile::load(&config_file)
                .map(|c| c.config.log_level)
                .unwrap_or_default();
            init_tracing(level);
            run_client(ClientOptions {
                room,
                secret,
                config_file,
                key,
                server,
            })
            .await
        }
        Some(Action::Server {
            host,
            port,
            root_folder,
            registration_keyfile,
        }) => {
            init_tracing(LogLevel::default());
            let server = RelayServer::new(ServerOptions {
                host,
                port,
                root_folder,
                registration_keyfile,
            })
            .await?;
            server.serve().await
        }
        Some(Action::Gui) | None => {
            init_tracing(LogLevel::default());
            Err(AppError::configuration(
                "this build ships without the GUI shell; use the 'client' or 'server' subcommand",
            ))
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("{e}");
        let code = match e {
            AppError::Transport { .. } => 2,
            _ => 1,
        };
        std::process::exit(code);
    }
}

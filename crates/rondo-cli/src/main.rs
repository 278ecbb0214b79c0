use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use rondo_core::logging::{init_logging_json, init_logging_with_level};
use rondo_core::{Server, ServerConfig};
use tracing::info;

mod demo;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "rondo")]
#[command(about = "Embeddable asynchronous HTTP server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server with the demonstration routes
    Serve(ServeArgs),
}

/// Flags override the `RONDO_*` environment variables.
#[derive(Args, Debug)]
struct ServeArgs {
    /// Bind host
    #[arg(long)]
    host: Option<String>,
    /// Bind port
    #[arg(long)]
    port: Option<u16>,
    /// Worker threads (0 = one per CPU)
    #[arg(long)]
    threads: Option<usize>,
    /// Value of the Server response header
    #[arg(long)]
    name: Option<String>,
    /// Prefix for every route
    #[arg(long)]
    base_uri: Option<String>,
    /// Abort the process when file descriptors or memory run out
    #[arg(long)]
    abort_on_resource_error: bool,
    /// Default log level; RUST_LOG wins when set
    #[arg(long, default_value = "info")]
    log_level: String,
    /// Emit JSON logs
    #[arg(long)]
    json_logs: bool,
}

impl ServeArgs {
    fn apply(self, config: &mut ServerConfig) {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        if let Some(name) = self.name {
            config.name = name;
        }
        if let Some(base_uri) = self.base_uri {
            config.base_uri = base_uri;
        }
        if self.abort_on_resource_error {
            config.abort_on_resource_error = true;
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => serve(args),
    }
}

fn serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    if args.json_logs {
        init_logging_json(&args.log_level);
    } else {
        init_logging_with_level(&args.log_level);
    }

    let mut config = ServerConfig::from_env()?;
    args.apply(&mut config);

    let mut server = Server::from_config(&config)?;
    demo::register(&mut server);

    let server = Arc::new(server);
    let stopper = server.clone();
    ctrlc::set_handler(move || {
        info!("received SIGINT, shutting down");
        stopper.stop();
    })?;

    info!("listening on http://{}{}", config.server_addr(), config.base_uri);
    server.run(config.thread_count())?;
    server.wait_until_stopped();
    info!("rondo shut down");
    Ok(())
}

use clap::Parser;

use termihui_server::server::{self, ServerConfig};

/// Multi-session terminal-sharing server.
#[derive(Parser, Debug)]
#[command(name = "termihui-server", version)]
struct Args {
    /// TCP address to bind the WebSocket listener on.
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// TCP port for the WebSocket listener.
    #[arg(long, default_value_t = 8777)]
    port: u16,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "termihui_server=info".into()),
        )
        .init();

    let args = Args::parse();
    server::run(ServerConfig {
        bind_address: args.bind,
        port: args.port,
    })
}

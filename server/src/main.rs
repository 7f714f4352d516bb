use clap::Parser;
use log::{error, info};
use server::auth::TokenIdentityProvider;
use server::config::{HeartbeatPolicy, MatchConfig, ServerConfig};
use server::ledger::LogLedger;
use server::network::Server;
use server::sequencer::QuestionBank;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "8080")]
    port: u16,
    /// Maximum simultaneous connections
    #[clap(short, long, default_value = "1024")]
    max_connections: usize,
    /// Rounds per match
    #[clap(short, long, default_value = "3")]
    rounds: u32,
    /// Read-only period at the start of each round, in seconds
    #[clap(long, default_value = "5")]
    thinking_secs: u64,
    /// How long round results stay up, in seconds
    #[clap(long, default_value = "4")]
    result_secs: u64,
    /// Expected heartbeat interval, in milliseconds
    #[clap(long, default_value = "2000")]
    heartbeat_ms: u64,
    /// Heartbeats a participant may miss before counting as gone
    #[clap(long, default_value = "3")]
    missed_beats: u32,
    /// Reconnect grace before the scoring midpoint, in seconds (0 disables)
    #[clap(long, default_value = "15")]
    grace_secs: u64,
    /// Window for both participants to join a new match, in seconds
    #[clap(long, default_value = "10")]
    attach_timeout_secs: u64,
}

impl Args {
    fn config(&self) -> ServerConfig {
        let heartbeat =
            HeartbeatPolicy::new(Duration::from_millis(self.heartbeat_ms), self.missed_beats);
        ServerConfig {
            bind_addr: format!("{}:{}", self.host, self.port),
            max_connections: self.max_connections,
            queue_heartbeat: heartbeat,
            matches: MatchConfig {
                max_rounds: self.rounds.max(1),
                thinking_time: Duration::from_secs(self.thinking_secs),
                result_time: Duration::from_secs(self.result_secs),
                heartbeat,
                reconnect_grace: Duration::from_secs(self.grace_secs),
                attach_timeout: Duration::from_secs(self.attach_timeout_secs),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.config();
    info!(
        "Starting quiz duel server: {} rounds, {} connections max",
        config.matches.max_rounds, config.max_connections
    );

    let server = Server::bind(
        config,
        Arc::new(QuestionBank::sample()?),
        Arc::new(LogLedger),
        Arc::new(TokenIdentityProvider),
    )
    .await?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}

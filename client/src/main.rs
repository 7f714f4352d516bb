use clap::Parser;
use client::network::{AnswerMode, Client, ClientOptions};
use client::rendering::describe;
use log::info;
use shared::TopicKey;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Identity token presented to the server
    #[arg(short = 'n', long)]
    token: String,

    /// Topic to queue on, as subject:category
    #[arg(short = 't', long, default_value = "math:algebra")]
    topic: TopicKey,

    /// Optional skill rating reported to matchmaking
    #[arg(long)]
    skill: Option<u32>,

    /// Answer randomly instead of reading option numbers from stdin
    #[arg(short = 'a', long)]
    auto: bool,

    /// Heartbeat interval in milliseconds
    #[arg(long, default_value = "2000")]
    heartbeat_ms: u64,

    /// Request a resync after this many milliseconds without events
    #[arg(long, default_value = "5000")]
    sync_after_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting client...");
    info!("Connecting to: {} as {}", args.server, args.token);
    if !args.auto {
        info!("Type an option number and press Enter to answer");
    }

    let mut client = Client::new(ClientOptions {
        server_addr: args.server,
        token: args.token,
        topic: args.topic,
        skill_rating: args.skill,
        answers: if args.auto {
            AnswerMode::Auto
        } else {
            AnswerMode::Stdin
        },
        heartbeat_interval: Duration::from_millis(args.heartbeat_ms.max(1)),
        sync_after: Duration::from_millis(args.sync_after_ms.max(1)),
        render: true,
    });

    let final_state = client.run().await?;
    println!("{}", describe(&final_state, shared::epoch_millis()));

    Ok(())
}

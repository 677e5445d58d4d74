use clap::Parser;
use client::{
    spawn_client, BackoffPolicy, ClientCommand, ClientConfig, ClientHandle, Credentials, SyncEvent,
};
use log::{error, info, warn};
use shared::geo::distance;
use shared::{PlaceOptions, Position};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// WebSocket URL of the server
    #[arg(short = 's', long, default_value = "ws://127.0.0.1:8080")]
    server: String,

    /// Player id presented in the handshake
    #[arg(short = 'p', long)]
    player_id: String,

    /// Display name
    #[arg(short = 'u', long)]
    username: Option<String>,

    /// Optional auth token
    #[arg(short = 't', long)]
    token: Option<String>,

    /// Reconnect attempts before giving up
    #[arg(long, default_value = "10")]
    max_reconnects: u32,
}

const HELP: &str = "commands: place <lat> <lng> [public <toll>] [name], remove <id>, \
harden <id>, teleport <id>, move <lat> <lng>, flags, mine, near <lat> <lng> <radius>, \
connect, disconnect, quit";

fn parse_position(lat: Option<&str>, lng: Option<&str>) -> Option<Position> {
    let lat = lat?.parse().ok()?;
    let lng = lng?.parse().ok()?;
    Some(Position::new(lat, lng))
}

fn parse_place(args: &[&str]) -> Option<ClientCommand> {
    let position = parse_position(args.first().copied(), args.get(1).copied())?;
    let mut rest = &args[2..];

    let mut options = PlaceOptions::default();
    if rest.first() == Some(&"public") {
        let toll = rest.get(1)?.parse().ok()?;
        options = PlaceOptions::public(None, toll);
        rest = &rest[2..];
    }
    if !rest.is_empty() {
        options.name = Some(rest.join(" "));
    }

    Some(ClientCommand::Place { position, options })
}

/// Returns false when the user asked to quit
async fn handle_line(line: &str, handle: &ClientHandle, player_id: &str) -> bool {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((&name, args)) = words.split_first() else {
        return true;
    };

    let command = match (name, args) {
        ("quit" | "exit", _) => return false,
        ("place", _) => parse_place(args),
        ("remove", [id]) => Some(ClientCommand::Remove(id.to_string())),
        ("harden", [id]) => Some(ClientCommand::Harden(id.to_string())),
        ("teleport", [id]) => Some(ClientCommand::Teleport(id.to_string())),
        ("move", [lat, lng]) => parse_position(Some(*lat), Some(*lng)).map(ClientCommand::Move),
        ("connect", []) => Some(ClientCommand::Connect),
        ("disconnect", []) => Some(ClientCommand::Disconnect),
        ("flags" | "mine", []) => {
            let flags = handle.flags().await.unwrap_or_default();
            for flag in flags
                .iter()
                .filter(|flag| name == "flags" || flag.is_owned_by(player_id))
            {
                println!(
                    "{} owner={} at ({:.5}, {:.5}){}{}",
                    flag.id,
                    flag.owner_id,
                    flag.position.lat,
                    flag.position.lng,
                    if flag.is_hardened { " hardened" } else { "" },
                    if flag.is_provisional { " (pending)" } else { "" },
                );
            }
            return true;
        }
        ("near", [lat, lng, radius]) => {
            let (Some(center), Ok(radius)) =
                (parse_position(Some(*lat), Some(*lng)), radius.parse::<f64>())
            else {
                println!("{}", HELP);
                return true;
            };
            let nearby = handle.flags_near(center, radius).await.unwrap_or_default();
            for flag in nearby {
                println!(
                    "{} owner={} {:.0} m",
                    flag.id,
                    flag.owner_id,
                    distance(&center, &flag.position)
                );
            }
            return true;
        }
        _ => None,
    };

    match command {
        Some(command) => {
            if !handle.send(command) {
                error!("Client task is not running");
                return false;
            }
        }
        None => println!("{}", HELP),
    }
    true
}

fn log_event(event: &SyncEvent) {
    match event {
        SyncEvent::CommandRejected {
            command, reason, ..
        } => warn!("{} rejected: {}", command, reason),
        SyncEvent::ServerError { message } => warn!("Server error: {}", message),
        SyncEvent::ForceDisconnected { reason } => warn!("Disconnected by server: {}", reason),
        other => info!("{:?}", other),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let mut config = ClientConfig::new(args.server.clone());
    config.backoff = BackoffPolicy {
        max_attempts: args.max_reconnects,
        ..BackoffPolicy::default()
    };

    let username = args.username.unwrap_or_else(|| args.player_id.clone());
    let mut credentials = Credentials::new(args.player_id.clone(), username);
    if let Some(token) = args.token {
        credentials = credentials.with_token(token);
    }

    info!("Starting client...");
    info!("Connecting to: {}", args.server);
    println!("{}", HELP);

    let mut handle = spawn_client(config, credentials);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        if !handle_line(&line, &handle, &args.player_id).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
            event = handle.next_event() => {
                match event {
                    Some(event) => log_event(&event),
                    None => break,
                }
            }
        }
    }

    handle.shutdown().await;
    Ok(())
}

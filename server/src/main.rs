use clap::Parser;
use log::{error, info};
use server::network::Server;
use server::world::WorldConfig;
use shared::{now_millis, Position};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Maximum number of concurrent connections
    #[arg(long, default_value = "64")]
    max_clients: usize,

    /// Minimum distance in meters between flags of different owners
    #[arg(long, default_value = "500")]
    territory_radius: f64,

    /// Resources spent to harden a flag
    #[arg(long, default_value = "50")]
    harden_cost: u64,

    /// Resources granted to new players
    #[arg(long, default_value = "100")]
    starting_resources: u64,

    /// Where new players appear, as LAT,LNG
    #[arg(long, value_parser = parse_position, default_value = "0,0")]
    spawn: Position,

    /// Random offset in degrees applied to each player's spawn point
    #[arg(long, default_value = "0")]
    spawn_jitter: f64,

    /// System flag to seed, as LAT,LNG (repeatable)
    #[arg(long = "system-flag", value_parser = parse_position)]
    system_flags: Vec<Position>,
}

impl Args {
    fn world_config(&self) -> WorldConfig {
        WorldConfig {
            territory_radius_m: self.territory_radius,
            harden_cost: self.harden_cost,
            starting_resources: self.starting_resources,
            spawn: self.spawn,
            spawn_jitter_deg: self.spawn_jitter.max(0.0),
        }
    }
}

fn parse_position(value: &str) -> Result<Position, String> {
    let (lat, lng) = value
        .split_once(',')
        .ok_or_else(|| format!("expected LAT,LNG, got {}", value))?;
    let lat = lat.trim().parse::<f64>().map_err(|e| e.to_string())?;
    let lng = lng.trim().parse::<f64>().map_err(|e| e.to_string())?;
    Ok(Position::new(lat, lng))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let config = args.world_config();

    info!("Starting server...");
    let address = format!("{}:{}", args.host, args.port);
    let mut server = Server::bind(&address, config, args.max_clients).await?;

    for (index, position) in args.system_flags.into_iter().enumerate() {
        let name = Some(format!("Waypoint {}", index + 1));
        server.world_mut().seed_system_flag(position, name, now_millis());
    }

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_world_defaults() {
        let args = Args::try_parse_from(["server"]).unwrap();
        let config = args.world_config();
        let defaults = WorldConfig::default();

        assert_eq!(config.territory_radius_m, defaults.territory_radius_m);
        assert_eq!(config.spawn, defaults.spawn);
        assert_eq!(config.spawn_jitter_deg, 0.0);
        assert!(args.system_flags.is_empty());
    }

    #[test]
    fn test_spawn_flags_reach_world_config() {
        let args = Args::try_parse_from([
            "server",
            "--spawn",
            "59.33,18.06",
            "--spawn-jitter",
            "0.01",
            "--system-flag",
            "1.5, 2.5",
        ])
        .unwrap();
        let config = args.world_config();

        assert_eq!(config.spawn, Position::new(59.33, 18.06));
        assert_eq!(config.spawn_jitter_deg, 0.01);
        assert_eq!(args.system_flags, vec![Position::new(1.5, 2.5)]);
    }

    #[test]
    fn test_malformed_position_is_rejected() {
        assert!(parse_position("59.33").is_err());
        assert!(parse_position("north,18").is_err());
        assert!(Args::try_parse_from(["server", "--spawn", "x"]).is_err());
    }
}

use clap::{Arg, Command};
use emulator::EmulatorConfig;
use std::time::Duration;
use tracing::info;

fn validate_count(value: &str) -> Result<usize, String> {
    let parsed: usize = value.parse().map_err(|_| "not a number".to_owned())?;
    if parsed == 0 {
        return Err("must be at least 1".to_owned());
    }
    Ok(parsed)
}

fn validate_u64(value: &str) -> Result<u64, String> {
    value.parse::<u64>().map_err(|_| "not a number".to_owned())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "emulator starting");

    let matches = Command::new("Bus Emulator")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Synthetic client fleet for load-testing a relaybus server")
        .arg(
            Arg::new("server")
                .help("Bus WebSocket endpoint")
                .short('s')
                .long("server")
                .default_value("ws://127.0.0.1:4000/ws"),
        )
        .arg(
            Arg::new("clients")
                .help("Number of concurrent synthetic clients")
                .short('c')
                .long("clients")
                .value_parser(validate_count)
                .default_value("10"),
        )
        .arg(
            Arg::new("rooms")
                .help("Number of rooms the clients spread across")
                .short('r')
                .long("rooms")
                .value_parser(validate_count)
                .default_value("2"),
        )
        .arg(
            Arg::new("interval")
                .help("Milliseconds between broadcasts per client")
                .short('i')
                .long("interval")
                .value_parser(validate_u64)
                .default_value("1000"),
        )
        .arg(
            Arg::new("duration")
                .help("Stop after this many seconds (runs until Ctrl-C if omitted)")
                .short('d')
                .long("duration")
                .value_parser(validate_u64),
        )
        .arg(
            Arg::new("no-presence")
                .help("Skip presence tracking")
                .long("no-presence")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let config = EmulatorConfig {
        server_url: matches
            .get_one::<String>("server")
            .expect("has default")
            .clone(),
        clients: *matches.get_one::<usize>("clients").expect("has default"),
        rooms: *matches.get_one::<usize>("rooms").expect("has default"),
        message_interval: Duration::from_millis(
            *matches.get_one::<u64>("interval").expect("has default"),
        ),
        presence: !matches.get_flag("no-presence"),
        run_for: matches
            .get_one::<u64>("duration")
            .map(|secs| Duration::from_secs(*secs)),
    };

    emulator::run(config).await;
}

//! skillswap-call
//!
//! Command line front end for the call signaling flow:
//!
//! * `relay` runs the signaling relay that pairs the two participants of an
//!   exchange call.
//! * `join` joins an exchange call through a relay with synthetic media and
//!   reads `m` (mute), `v` (video) and `q` (end) from stdin.
//! * `probe-ice` checks that STUN/TURN servers answer.

use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use skillswap_call::peer::probe_ice_server;
use skillswap_call::{
    logger, CallConfig, CallError, CallSession, MediaConstraints, RelayConfig, ServerConfig,
    SignalingChannel, SyntheticDevices,
};
use tokio::io::{AsyncBufReadExt, BufReader};

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "skillswap-call", version, about = "Skill exchange call signaling")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the signaling relay
    Relay(RelayArgs),
    /// Join an exchange call
    Join(JoinArgs),
    /// Check that ICE servers answer
    ProbeIce(ProbeArgs),
}

#[derive(Args, Debug)]
struct RelayArgs {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "RELAY_PORT")]
    port: u16,

    /// Participants allowed per call room
    #[arg(long, default_value_t = 2, env = "RELAY_MAX_PARTICIPANTS")]
    max_participants: usize,
}

#[derive(Args, Debug)]
struct JoinArgs {
    /// Relay WebSocket URL
    #[arg(long, default_value = "ws://127.0.0.1:8080/ws", env = "RELAY_URL")]
    relay: String,

    /// Our user id
    #[arg(long, env = "CALL_USER_ID")]
    user: String,

    /// Exchange id; the call room is call-<exchange>
    #[arg(long, env = "CALL_EXCHANGE_ID")]
    exchange: String,

    /// ICE servers, comma-separated: stun:host:port or turn:user:pass@host:port
    /// (stuns: and turns: also accepted).
    /// Defaults to a public STUN server.
    #[arg(long = "ice-server", env = "ICE_SERVERS", value_delimiter = ',')]
    ice_servers: Vec<String>,

    /// Skip the camera
    #[arg(long)]
    audio_only: bool,

    /// Same-host call: loopback candidates, no STUN
    #[arg(long)]
    local: bool,

    /// Keep the audio path alive with Opus silence
    #[arg(long, default_value_t = true, env = "CALL_SEND_SILENCE", action = clap::ArgAction::Set)]
    send_silence: bool,
}

#[derive(Args, Debug)]
struct ProbeArgs {
    /// Servers to probe, same format as `join --ice-server`
    #[arg(long = "ice-server", env = "ICE_SERVERS", value_delimiter = ',', required = true)]
    ice_servers: Vec<String>,

    /// Seconds to wait for each server
    #[arg(long, default_value_t = 5)]
    timeout_secs: u64,
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Relay(args) => run_relay(args).await,
        Command::Join(args) => run_join(args).await,
        Command::ProbeIce(args) => run_probe(args).await,
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "Exiting");
        std::process::exit(1);
    }
}

fn parse_servers(values: &[String]) -> Result<Vec<ServerConfig>, CallError> {
    values
        .iter()
        .filter(|v| !v.trim().is_empty())
        .enumerate()
        .map(|(i, v)| CallConfig::parse_ice_server(format!("cli-{i}"), v))
        .collect()
}

async fn run_relay(args: RelayArgs) -> Result<(), CallError> {
    let config = RelayConfig {
        port: args.port,
        max_participants: args.max_participants,
    };
    tracing::info!(
        port = config.port,
        max_participants = config.max_participants,
        "Starting signaling relay"
    );
    skillswap_call::relay::serve(config)
        .await
        .map_err(|e| CallError::Transport(e.to_string()))
}

async fn run_join(args: JoinArgs) -> Result<(), CallError> {
    let mut config = if args.local {
        CallConfig::local()
    } else {
        CallConfig::default()
    };
    let servers = parse_servers(&args.ice_servers)?;
    if !servers.is_empty() {
        config = config.with_ice_servers(servers);
    }
    config.send_silence = args.send_silence;
    config.validate()?;

    let constraints = if args.audio_only {
        MediaConstraints::audio_only()
    } else {
        MediaConstraints::default()
    };

    let channel = SignalingChannel::connect(&args.relay).await?;
    let session = CallSession::new(args.exchange, args.user, config);
    let handle = session.start(&channel, &SyntheticDevices, constraints);
    println!("Joined {}. Commands: m = mute, v = video, q = end", handle.room_id());

    let mut status = handle.watch_status();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                println!("status: {current}");
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => match line.trim() {
                    "m" => println!("audio enabled: {:?}", handle.toggle_audio().await?),
                    "v" => println!("video enabled: {:?}", handle.toggle_video().await?),
                    "q" => break,
                    "" => {}
                    other => println!("unknown command {other:?}"),
                },
                // stdin closed: keep the call up until ctrl-c
                Ok(None) => {
                    tokio::signal::ctrl_c().await.map_err(|e| CallError::Transport(e.to_string()))?;
                    break;
                }
                Err(e) => return Err(CallError::Transport(e.to_string())),
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let summary = handle.end().await?;
    println!(
        "call {} ended: status={} role={:?} counterpart={:?} remote tracks={:?}",
        summary.room_id, summary.final_status, summary.role, summary.counterpart, summary.remote_tracks
    );
    Ok(())
}

async fn run_probe(args: ProbeArgs) -> Result<(), CallError> {
    let servers = parse_servers(&args.ice_servers)?;
    let wait = Duration::from_secs(args.timeout_secs);
    let mut unreachable = 0;

    for server in &servers {
        let reachable = probe_ice_server(server, wait).await?;
        println!("{} {}", if reachable { "ok  " } else { "FAIL" }, server.url);
        if !reachable {
            unreachable += 1;
        }
    }

    if unreachable > 0 {
        return Err(CallError::Config(format!("{unreachable} ICE server(s) unreachable")));
    }
    Ok(())
}

use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use clap::{Args, Subcommand};
use tether_peer::{PeerConnection, PeerEventSink};
use tether_transport::{DeviceEndpoint, DeviceId, TcpTransport};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::exit::{peer_error, CliError, CliResult, INTERNAL, SUCCESS, USAGE};
use crate::output::{print_connection, print_frame, OutputFormat};

pub mod client;
pub mod host;
pub mod send;
pub mod version;

/// Port used when neither `--port` nor `TETHER_PORT` is given.
pub const DEFAULT_PORT: u16 = 9000;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the host role: dial the listed devices and print received frames.
    Host(HostArgs),
    /// Run the client role: listen on loopback and print received frames.
    Client(ClientArgs),
    /// Dial a device, send a single frame, and exit.
    Send(SendArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    if let Command::Version(args) = command {
        return version::run(args);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::new(INTERNAL, format!("failed to start runtime: {err}")))?;

    runtime.block_on(async move {
        match command {
            Command::Host(args) => host::run(args, format).await,
            Command::Client(args) => client::run(args, format).await,
            Command::Send(args) => send::run(args, format).await,
            Command::Version(args) => version::run(args),
        }
    })
}

/// `ID=HOST[:PORT]` device address given on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSpec {
    pub id: DeviceId,
    pub endpoint: DeviceEndpoint,
}

impl FromStr for DeviceSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, endpoint) = s
            .split_once('=')
            .ok_or_else(|| format!("expected ID=HOST[:PORT], got {s:?}"))?;
        let id = id
            .parse::<DeviceId>()
            .map_err(|err| format!("invalid device id {id:?}: {err}"))?;
        let endpoint = endpoint
            .parse::<DeviceEndpoint>()
            .map_err(|err| format!("invalid device address {endpoint:?}: {err}"))?;
        Ok(Self { id, endpoint })
    }
}

#[derive(Args, Debug)]
pub struct ReceiveArgs {
    /// Send every received frame back on the same type id.
    #[arg(long)]
    pub echo: bool,
    /// Accept only these type ids (comma-separated). Default: all.
    #[arg(long, value_delimiter = ',', value_name = "TYPE")]
    pub types: Option<Vec<u32>>,
    /// Exit after receiving N frames.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct HostArgs {
    /// Port devices are dialed on.
    #[arg(long, env = "TETHER_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,
    /// Device to track (repeatable). The last one listed is pursued first.
    #[arg(long = "device", value_name = "ID=HOST[:PORT]", required = true)]
    pub devices: Vec<DeviceSpec>,
    /// Port for the host's own loopback listener. Default: --port.
    #[arg(long)]
    pub listen_port: Option<u16>,
    #[command(flatten)]
    pub receive: ReceiveArgs,
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Loopback port to listen on.
    #[arg(long, env = "TETHER_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,
    #[command(flatten)]
    pub receive: ReceiveArgs,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Port the device is dialed on.
    #[arg(long, env = "TETHER_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,
    /// Device to dial.
    #[arg(long, value_name = "ID=HOST[:PORT]")]
    pub device: DeviceSpec,
    /// Frame type id.
    #[arg(long = "type", short = 't', value_name = "TYPE")]
    pub type_id: u32,
    /// Correlation tag. Default: none.
    #[arg(long)]
    pub tag: Option<u32>,
    /// JSON payload.
    #[arg(long, conflicts_with_all = ["data", "file"])]
    pub json: Option<String>,
    /// Raw string payload.
    #[arg(long, conflicts_with_all = ["json", "file"])]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with_all = ["json", "data"])]
    pub file: Option<PathBuf>,
    /// Wait for one response frame and print it.
    #[arg(long)]
    pub wait: bool,
    /// Time allowed for connecting, and for the response with --wait (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// What the CLI sink forwards to the command loop.
#[derive(Debug)]
pub enum Incoming {
    Data { type_id: u32, payload: Bytes },
    Connection(bool),
}

/// Sink that hands events to the command loop over a channel.
pub struct CliSink {
    accepted: Option<HashSet<u32>>,
    incoming: mpsc::UnboundedSender<Incoming>,
}

impl CliSink {
    pub fn new(types: Option<Vec<u32>>) -> (Self, mpsc::UnboundedReceiver<Incoming>) {
        let (incoming, rx) = mpsc::unbounded_channel();
        let sink = Self {
            accepted: types.map(|types| types.into_iter().collect()),
            incoming,
        };
        (sink, rx)
    }
}

impl PeerEventSink for CliSink {
    fn should_accept_data_of_type(&self, type_id: u32) -> bool {
        self.accepted
            .as_ref()
            .is_none_or(|accepted| accepted.contains(&type_id))
    }

    fn did_receive_data(&self, payload: Bytes, type_id: u32) {
        let _ = self.incoming.send(Incoming::Data { type_id, payload });
    }

    fn did_change_connection(&self, connected: bool) {
        let _ = self.incoming.send(Incoming::Connection(connected));
    }
}

/// Print (and optionally echo) inbound frames until Ctrl-C or `--count`.
pub async fn serve(
    peer: &PeerConnection<TcpTransport>,
    mut incoming: mpsc::UnboundedReceiver<Incoming>,
    args: &ReceiveArgs,
    format: OutputFormat,
) -> CliResult<i32> {
    let role = peer.role().as_str();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut received = 0usize;
    loop {
        let next = tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupted; shutting down");
                break;
            }
            next = incoming.recv() => next,
        };

        match next {
            Some(Incoming::Connection(connected)) => print_connection(connected, role, format),
            Some(Incoming::Data { type_id, payload }) => {
                print_frame(type_id, &payload, role, format);
                if args.echo {
                    if let Err(err) = peer.send(type_id, payload).await {
                        warn!(type_id, error = %err, "echo failed");
                    }
                }
                received = received.saturating_add(1);
                if args.count.is_some_and(|count| received >= count) {
                    break;
                }
            }
            None => break,
        }
    }

    peer.shutdown()
        .await
        .map_err(|err| peer_error("shutdown failed", err))?;
    Ok(SUCCESS)
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(match unit {
        "ms" => Duration::from_millis(value),
        _ => Duration::from_secs(value),
    })
}

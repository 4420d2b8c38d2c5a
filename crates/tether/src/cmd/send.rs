use std::fs;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tether_frame::NO_TAG;
use tether_peer::{PeerConfig, PeerConnection, Role};
use tether_transport::{DeviceDirectory, ManualDeviceMonitor, TcpTransport};
use tokio::sync::mpsc;
use tracing::debug;

use crate::cmd::{parse_duration, CliSink, Incoming, SendArgs};
use crate::exit::{peer_error, CliError, CliResult, INTERNAL, SUCCESS, TIMEOUT, USAGE};
use crate::output::{print_frame, OutputFormat};

pub async fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let payload = resolve_payload(&args)?;

    let directory = DeviceDirectory::new();
    directory.insert(args.device.id, args.device.endpoint);
    let monitor = ManualDeviceMonitor::new();
    let (sink, mut incoming) = CliSink::new(None);

    // Ephemeral listener so a running host on --port does not clash.
    let peer = PeerConnection::new(Role::Host, TcpTransport::new(directory), Arc::new(sink))
        .with_config(PeerConfig::default().with_listen_port(0))
        .with_monitor(Arc::new(monitor.clone()));
    peer.start(args.port)
        .map_err(|err| peer_error("start failed", err))?;
    monitor.attach(args.device.id);

    let result = exchange(&peer, &args, payload, &mut incoming, timeout, format).await;
    peer.shutdown()
        .await
        .map_err(|err| peer_error("shutdown failed", err))?;
    result
}

async fn exchange(
    peer: &PeerConnection<TcpTransport>,
    args: &SendArgs,
    payload: Bytes,
    incoming: &mut mpsc::UnboundedReceiver<Incoming>,
    timeout: Duration,
    format: OutputFormat,
) -> CliResult<i32> {
    let mut snapshots = peer.watch();
    tokio::time::timeout(timeout, snapshots.wait_for(|snapshot| snapshot.is_connected()))
        .await
        .map_err(|_| {
            CliError::new(
                TIMEOUT,
                format!("device {} not reachable within {timeout:?}", args.device.id),
            )
        })?
        .map_err(|_| CliError::new(INTERNAL, "connection stopped before connecting"))?;

    peer.send_tagged(args.type_id, args.tag.unwrap_or(NO_TAG), payload)
        .await
        .map_err(|err| peer_error("send failed", err))?;
    debug!(type_id = args.type_id, "frame sent");

    if !args.wait {
        return Ok(SUCCESS);
    }

    let (type_id, payload) = tokio::time::timeout(timeout, next_frame(incoming))
        .await
        .map_err(|_| CliError::new(TIMEOUT, format!("no response within {timeout:?}")))?
        .ok_or_else(|| CliError::new(INTERNAL, "connection stopped before a response arrived"))?;
    print_frame(type_id, &payload, peer.role().as_str(), format);
    Ok(SUCCESS)
}

async fn next_frame(incoming: &mut mpsc::UnboundedReceiver<Incoming>) -> Option<(u32, Bytes)> {
    while let Some(event) = incoming.recv().await {
        if let Incoming::Data { type_id, payload } = event {
            return Some((type_id, payload));
        }
    }
    None
}

fn resolve_payload(args: &SendArgs) -> CliResult<Bytes> {
    if let Some(json) = &args.json {
        serde_json::from_str::<serde_json::Value>(json)
            .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")))?;
        return Ok(Bytes::copy_from_slice(json.as_bytes()));
    }
    if let Some(data) = &args.data {
        return Ok(Bytes::copy_from_slice(data.as_bytes()));
    }
    if let Some(path) = &args.file {
        return fs::read(path).map(Bytes::from).map_err(|err| {
            crate::exit::io_error(&format!("failed reading {}", path.display()), err)
        });
    }
    Ok(Bytes::new())
}

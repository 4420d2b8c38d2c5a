use std::sync::Arc;

use tether_peer::{PeerConfig, PeerConnection, Role};
use tether_transport::{DeviceDirectory, ManualDeviceMonitor, TcpTransport};
use tracing::info;

use crate::cmd::{serve, CliSink, HostArgs};
use crate::exit::{peer_error, CliResult};
use crate::output::OutputFormat;

pub async fn run(args: HostArgs, format: OutputFormat) -> CliResult<i32> {
    let directory = DeviceDirectory::new();
    for spec in &args.devices {
        directory.insert(spec.id, spec.endpoint);
    }

    let mut config = PeerConfig::default();
    if let Some(listen_port) = args.listen_port {
        config = config.with_listen_port(listen_port);
    }

    let monitor = ManualDeviceMonitor::new();
    let (sink, incoming) = CliSink::new(args.receive.types.clone());
    let peer = PeerConnection::new(Role::Host, TcpTransport::new(directory), Arc::new(sink))
        .with_config(config)
        .with_monitor(Arc::new(monitor.clone()));

    peer.start(args.port)
        .map_err(|err| peer_error("start failed", err))?;

    for spec in &args.devices {
        info!(device = %spec.id, endpoint = %spec.endpoint, "device attached");
        monitor.attach(spec.id);
    }

    serve(&peer, incoming, &args.receive, format).await
}

use std::sync::Arc;

use tether_peer::{PeerConnection, Role};
use tether_transport::{DeviceDirectory, TcpTransport};

use crate::cmd::{serve, CliSink, ClientArgs};
use crate::exit::{peer_error, CliResult};
use crate::output::OutputFormat;

pub async fn run(args: ClientArgs, format: OutputFormat) -> CliResult<i32> {
    let (sink, incoming) = CliSink::new(args.receive.types.clone());
    let peer = PeerConnection::new(
        Role::Client,
        TcpTransport::new(DeviceDirectory::new()),
        Arc::new(sink),
    );

    peer.start(args.port)
        .map_err(|err| peer_error("start failed", err))?;

    serve(&peer, incoming, &args.receive, format).await
}

//! Host and client on one machine, exchanging typed packets over TCP.
//!
//! The client listens on an ephemeral loopback port; the host is told the
//! device lives there, dials it, and sends a `Ping`. The client answers with a
//! `Pong` carrying the same sequence number.
//!
//! Run with: `cargo run -p tether --example loopback`

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether::peer::{PeerConfig, PeerConnection, Role, RoutedSink};
use tether::registry::{Dispatcher, PacketRegistry, RegistryError, TypedPacket};
use tether::transport::{
    DeviceDirectory, DeviceEndpoint, DeviceId, ManualDeviceMonitor, TcpTransport,
};
use tokio::sync::mpsc;

#[derive(Debug, Serialize, Deserialize)]
struct Ping {
    seq: u32,
}

impl TypedPacket for Ping {
    const TYPE_ID: u32 = 1;
}

#[derive(Debug, Serialize, Deserialize)]
struct Pong {
    seq: u32,
}

impl TypedPacket for Pong {
    const TYPE_ID: u32 = 2;
}

fn registry() -> Result<Arc<PacketRegistry>, RegistryError> {
    let mut registry = PacketRegistry::new();
    registry.register_packet::<Ping>()?;
    registry.register_packet::<Pong>()?;
    Ok(Arc::new(registry))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let registry = registry()?;

    // Client: forwards pings into a channel the main task answers from.
    let (pings_tx, mut pings) = mpsc::unbounded_channel();
    let mut client_routes = Dispatcher::new(Arc::clone(&registry));
    client_routes.route::<Ping, _>(Ping::TYPE_ID, move |ping| {
        let _ = pings_tx.send(ping);
    })?;
    let (client_sink, _client_errors) = RoutedSink::new(client_routes);
    let client = PeerConnection::new(
        Role::Client,
        TcpTransport::new(DeviceDirectory::new()),
        Arc::new(client_sink),
    )
    .with_registry(Arc::clone(&registry));
    client.start(0)?;

    let mut client_state = client.watch();
    let listen_addr = client_state
        .wait_for(|snapshot| snapshot.listen_addr.is_some())
        .await?
        .listen_addr
        .ok_or("client did not bind")?;
    println!("client listening on {listen_addr}");

    // Host: knows device 1 lives at the client's listener.
    let (pongs_tx, mut pongs) = mpsc::unbounded_channel();
    let mut host_routes = Dispatcher::new(Arc::clone(&registry));
    host_routes.route::<Pong, _>(Pong::TYPE_ID, move |pong| {
        let _ = pongs_tx.send(pong);
    })?;
    let (host_sink, _host_errors) = RoutedSink::new(host_routes);
    let host_sink = host_sink.on_connection_changed(|connected| {
        println!("host connected: {connected}");
    });

    let device = DeviceId(1);
    let directory = DeviceDirectory::new();
    directory.insert(device, DeviceEndpoint::from(listen_addr));
    let monitor = ManualDeviceMonitor::new();
    let host = PeerConnection::new(Role::Host, TcpTransport::new(directory), Arc::new(host_sink))
        .with_config(PeerConfig::default().with_listen_port(0))
        .with_monitor(Arc::new(monitor.clone()))
        .with_registry(Arc::clone(&registry));
    host.start(listen_addr.port())?;
    monitor.attach(device);

    let mut host_state = host.watch();
    host_state.wait_for(|snapshot| snapshot.is_connected()).await?;

    for seq in 0..3 {
        host.send_packet(&Ping { seq }).await?;
        let ping = pings.recv().await.ok_or("client stopped")?;
        println!("client got {ping:?}");
        client.send_packet(&Pong { seq: ping.seq }).await?;
        let pong = tokio::time::timeout(Duration::from_secs(1), pongs.recv())
            .await?
            .ok_or("host stopped")?;
        println!("host got {pong:?}");
    }

    host.shutdown().await?;
    client.shutdown().await?;
    Ok(())
}

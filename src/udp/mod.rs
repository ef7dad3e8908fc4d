pub mod protocol;

use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::lorawan;
use protocol::{GwmpPacket, PushDataPayload, Rxpk};

/// Run a minimal network-server stand-in on `bind`.
///
/// Every PUSH_DATA is acknowledged and its frames are decoded and logged,
/// which is enough to watch a replay land without a real network server.
pub async fn run_sink(bind: &str) -> anyhow::Result<()> {
    let socket = UdpSocket::bind(bind).await?;
    serve_sink(socket).await
}

/// Sink loop over an already bound socket
pub async fn serve_sink(socket: UdpSocket) -> anyhow::Result<()> {
    info!("PUSH_DATA sink listening on {}", socket.local_addr()?);

    let mut buf = vec![0u8; 65535];

    loop {
        let (len, src) = socket.recv_from(&mut buf).await?;
        debug!("Received {} bytes from {}", len, src);

        match GwmpPacket::parse(&buf[..len]) {
            Ok(packet) => {
                handle_packet(&socket, src, packet).await;
            }
            Err(e) => {
                warn!("Failed to parse GWMP packet from {}: {}", src, e);
            }
        }
    }
}

async fn handle_packet(socket: &UdpSocket, src: SocketAddr, packet: GwmpPacket) {
    match packet {
        GwmpPacket::PushData {
            random_token,
            gateway_eui,
            json_payload,
        } => {
            info!(
                "PUSH_DATA from gateway {} (token: 0x{:04x})",
                hex::encode(gateway_eui),
                random_token
            );

            let ack = GwmpPacket::push_ack(random_token);
            if let Err(e) = socket.send_to(&ack, src).await {
                error!("Failed to send PUSH_ACK to {}: {}", src, e);
            }

            match serde_json::from_str::<PushDataPayload>(&json_payload) {
                Ok(payload) => {
                    for rxpk in payload.rxpk.unwrap_or_default() {
                        log_rxpk(&rxpk);
                    }
                    if let Some(stat) = payload.stat {
                        debug!("  Gateway status: {}", stat);
                    }
                }
                Err(e) => {
                    warn!("Failed to parse PUSH_DATA JSON: {}", e);
                    debug!("  Raw JSON: {}", json_payload);
                }
            }
        }
        GwmpPacket::PullData {
            random_token,
            gateway_eui,
        } => {
            debug!(
                "PULL_DATA from gateway {} (token: 0x{:04x})",
                hex::encode(gateway_eui),
                random_token
            );

            let ack = GwmpPacket::pull_ack(random_token);
            if let Err(e) = socket.send_to(&ack, src).await {
                error!("Failed to send PULL_ACK to {}: {}", src, e);
            }
        }
    }
}

fn log_rxpk(rxpk: &Rxpk) {
    info!(
        "  rxpk: time={} freq={} MHz, rssi={} dBm, datr={}, size={} bytes",
        rxpk.time().unwrap_or("-"),
        rxpk.display("freq").unwrap_or("-".to_string()),
        rxpk.display("rssi").unwrap_or("-".to_string()),
        rxpk.datr().unwrap_or("-"),
        rxpk.display("size").unwrap_or("-".to_string()),
    );

    match rxpk.phy_payload() {
        Ok(phy_payload) => match lorawan::parse_phy_payload(&phy_payload) {
            Ok(frame) => info!("  LoRaWAN: {}", frame),
            Err(e) => warn!("  Failed to decode LoRaWAN frame: {}", e),
        },
        Err(e) => warn!("  {}", e),
    }
}

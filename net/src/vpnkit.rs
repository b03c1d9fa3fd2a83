//! Handshake spoken by hyperkit's virtio-net-vpnkit backend before frames
//! start flowing.

use crate::config::parse_mac;
use crate::error::{NetError, Result};
use crate::eth::format_mac;
use smoltcp::wire::EthernetAddress;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;
use uuid::Uuid;

pub const INIT_MSG_LEN: usize = 49;
pub const COMMAND_MSG_LEN: usize = 41;
pub const RESPONSE_LEN: usize = 258;

const ETHERNET_HEADER_LEN: u16 = 14;

/// Runs the server side of the handshake and returns the MAC handed to the
/// client.
pub async fn handshake<S>(stream: &mut S, mtu: u16, macs: &HashMap<String, String>) -> Result<EthernetAddress>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut init = [0u8; INIT_MSG_LEN];
    stream
        .read_exact(&mut init)
        .await
        .map_err(|e| NetError::Handshake(format!("reading init message: {}", e)))?;
    stream.write_all(&init).await?;

    let mut command = [0u8; COMMAND_MSG_LEN];
    stream
        .read_exact(&mut command)
        .await
        .map_err(|e| NetError::Handshake(format!("reading command: {}", e)))?;
    let uuid = String::from_utf8_lossy(&command[1..37]).into_owned();
    debug!(uuid = %uuid, "vpnkit uuid sent by hyperkit");

    let mac = mac_for(&uuid, macs)?;
    debug!(mac = %format_mac(&mac), "sending vpnkit mac address");

    stream.write_all(&response(mtu, mac)).await?;
    stream.flush().await?;
    Ok(mac)
}

/// `[1, mtu LE, mtu + 14 LE, mac, 0…]`
pub fn response(mtu: u16, mac: EthernetAddress) -> [u8; RESPONSE_LEN] {
    let mut resp = [0u8; RESPONSE_LEN];
    resp[0] = 0x01;
    resp[1..3].copy_from_slice(&mtu.to_le_bytes());
    resp[3..5].copy_from_slice(&mtu.saturating_add(ETHERNET_HEADER_LEN).to_le_bytes());
    resp[5..11].copy_from_slice(mac.as_bytes());
    resp
}

/// The configured MAC for `uuid`, or a random locally administered one.
pub fn mac_for(uuid: &str, macs: &HashMap<String, String>) -> Result<EthernetAddress> {
    if let Some(mac) = macs.get(uuid) {
        return parse_mac(mac);
    }
    if let Ok(parsed) = Uuid::parse_str(uuid) {
        let canonical = parsed.hyphenated().to_string();
        if let Some(mac) = macs.iter().find_map(|(k, v)| k.eq_ignore_ascii_case(&canonical).then_some(v)) {
            return parse_mac(mac);
        }
    }
    Ok(random_mac())
}

pub fn random_mac() -> EthernetAddress {
    let mut mac: [u8; 6] = rand::random();
    // Locally administered, unicast.
    mac[0] |= 0x02;
    mac[0] &= !0x01;
    EthernetAddress(mac)
}

//! Learning Ethernet switch between client connections and the gateway.

use crate::error::{NetError, Result};
use crate::eth;
use crate::ip_pool::IpPool;
use crate::protocol::{Conn, FrameReader, FrameWriter};
use async_trait::async_trait;
use serde::Serialize;
use smoltcp::wire::EthernetAddress;
use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// The gateway side of the switch.
pub trait VirtualDevice: Send + Sync {
    fn deliver_network_packet(&self, frame: Vec<u8>);
    fn link_address(&self) -> EthernetAddress;
    fn ip(&self) -> Ipv4Addr;
}

/// Frames emitted by the gateway enter the switch through this trait.
#[async_trait]
pub trait NetworkSwitch: Send + Sync {
    async fn deliver_network_packet(&self, frame: Vec<u8>);
}

struct ConnHandle {
    writer: tokio::sync::Mutex<Box<dyn FrameWriter>>,
    peer: String,
    cancel: CancellationToken,
    /// Pool holding the address handed out by the connection handshake.
    lease: Option<Arc<IpPool>>,
}

#[derive(Debug, Serialize)]
struct Handshake {
    mtu: usize,
    gateway: String,
    vm: String,
}

pub struct Switch {
    debug: bool,
    mtu: usize,
    sent: AtomicU64,
    received: AtomicU64,
    next_id: AtomicU64,
    conns: Mutex<HashMap<u64, Arc<ConnHandle>>>,
    cam: RwLock<HashMap<EthernetAddress, u64>>,
    write_lock: tokio::sync::Mutex<()>,
    gateway: OnceLock<Arc<dyn VirtualDevice>>,
}

impl Switch {
    pub fn new(debug: bool, mtu: usize) -> Self {
        Self {
            debug,
            mtu,
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            next_id: AtomicU64::new(0),
            conns: Mutex::new(HashMap::new()),
            cam: RwLock::new(HashMap::new()),
            write_lock: tokio::sync::Mutex::new(()),
            gateway: OnceLock::new(),
        }
    }

    /// Attaches the gateway device. Only the first call has an effect.
    pub fn connect(&self, gateway: Arc<dyn VirtualDevice>) {
        if self.gateway.set(gateway).is_err() {
            debug!("gateway already connected to the switch");
        }
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn bytes_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Snapshot of the MAC → connection id table.
    pub fn cam(&self) -> HashMap<String, u64> {
        read(&self.cam)
            .iter()
            .map(|(mac, id)| (eth::format_mac(mac), *id))
            .collect()
    }

    pub fn connections(&self) -> usize {
        lock(&self.conns).len()
    }

    /// Serves a client connection until it fails, reaches EOF or `cancel`
    /// fires.
    pub async fn accept(&self, cancel: CancellationToken, conn: Conn) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.serve(cancel, id, conn, None).await
    }

    /// Like `accept`, but first leases an address keyed by the connection id
    /// and tells the client about it with a JSON message
    /// `{"mtu":…,"gateway":…,"vm":…}` sent as the first frame.
    pub async fn accept_with_handshake(
        &self,
        cancel: CancellationToken,
        mut conn: Conn,
        pool: Arc<IpPool>,
        gateway_ip: Ipv4Addr,
        mtu: usize,
    ) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let vm = pool.assign(&id.to_string())?;

        let handshake = serde_json::to_vec(&Handshake {
            mtu,
            gateway: gateway_ip.to_string(),
            vm: vm.to_string(),
        })?;
        if let Err(e) = conn.writer.write_frame(&handshake).await {
            pool.release(&id.to_string());
            return Err(NetError::Handshake(e.to_string()));
        }
        info!(id, vm = %vm, peer = %conn.peer, "handshake sent");

        self.serve(cancel, id, conn, Some(pool)).await
    }

    async fn serve(
        &self,
        cancel: CancellationToken,
        id: u64,
        conn: Conn,
        lease: Option<Arc<IpPool>>,
    ) -> Result<()> {
        let Conn {
            mut reader,
            writer,
            peer,
            ..
        } = conn;
        let conn_cancel = cancel.child_token();
        lock(&self.conns).insert(
            id,
            Arc::new(ConnHandle {
                writer: tokio::sync::Mutex::new(writer),
                peer: peer.clone(),
                cancel: conn_cancel.clone(),
                lease,
            }),
        );
        info!(id, peer = %peer, "new connection");

        let res = self.rx(&conn_cancel, id, reader.as_mut()).await;
        self.disconnect(id).await;
        if let Err(e) = &res {
            error!(id, peer = %peer, error = %e, "connection closed");
        } else {
            info!(id, peer = %peer, "connection closed");
        }
        res
    }

    async fn rx(&self, cancel: &CancellationToken, id: u64, reader: &mut dyn FrameReader) -> Result<()> {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                frame = reader.read_frame() => frame,
            };
            match frame {
                Ok(frame) => self.rx_buf(id, frame).await,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    return Err(NetError::Framing(e.to_string()));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn rx_buf(&self, id: u64, frame: Vec<u8>) {
        let (Some(dst), Some(src)) = (eth::dst_mac(&frame), eth::src_mac(&frame)) else {
            debug!(id, len = frame.len(), "dropping runt frame");
            return;
        };
        if self.debug {
            debug!(id, "rx {}", eth::pretty(&frame));
        }

        write(&self.cam).insert(src, id);
        let len = frame.len() as u64;

        let gateway = self.gateway.get();
        let to_gateway = gateway
            .map(|gw| dst == gw.link_address() || dst.is_broadcast())
            .unwrap_or(false);
        let to_switch = gateway.map(|gw| dst != gw.link_address()).unwrap_or(true);

        match (to_switch, to_gateway, gateway) {
            (true, true, Some(gw)) => {
                self.tx(&frame).await;
                gw.deliver_network_packet(frame);
            }
            (true, _, _) => self.tx(&frame).await,
            (false, true, Some(gw)) => gw.deliver_network_packet(frame),
            _ => {}
        }

        self.received.fetch_add(len, Ordering::Relaxed);
    }

    /// Forwards a frame to the connections it is addressed to.
    ///
    /// Broadcast frames go to every connection except the one the source MAC
    /// was learned on. Unicast frames for an unknown MAC are dropped.
    pub async fn tx(&self, frame: &[u8]) {
        let (Some(dst), Some(src)) = (eth::dst_mac(frame), eth::src_mac(frame)) else {
            return;
        };
        let _guard = self.write_lock.lock().await;

        let targets: Vec<(u64, Arc<ConnHandle>)> = if dst.is_broadcast() {
            let src_id = read(&self.cam).get(&src).copied();
            lock(&self.conns)
                .iter()
                .filter(|(id, _)| Some(**id) != src_id)
                .map(|(id, handle)| (*id, handle.clone()))
                .collect()
        } else {
            let Some(id) = read(&self.cam).get(&dst).copied() else {
                if self.debug {
                    debug!(dst = %dst, "unknown destination, dropping frame");
                }
                return;
            };
            lock(&self.conns)
                .get(&id)
                .map(|handle| vec![(id, handle.clone())])
                .unwrap_or_default()
        };

        for (id, handle) in targets {
            let res = handle.writer.lock().await.write_frame(frame).await;
            match res {
                Ok(()) => {
                    self.sent.fetch_add(frame.len() as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    error!(id, peer = %handle.peer, error = %e, "cannot send frame, disconnecting");
                    self.disconnect(id).await;
                }
            }
        }
    }

    async fn disconnect(&self, id: u64) {
        let handle = lock(&self.conns).remove(&id);
        write(&self.cam).retain(|_, owner| *owner != id);

        if let Some(handle) = handle {
            handle.cancel.cancel();
            if let Some(pool) = &handle.lease {
                pool.release(&id.to_string());
            }
            if let Err(e) = handle.writer.lock().await.close().await {
                debug!(id, error = %e, "error closing connection");
            }
        }
    }
}

#[async_trait]
impl NetworkSwitch for Switch {
    async fn deliver_network_packet(&self, frame: Vec<u8>) {
        self.tx(&frame).await;
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn read<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|e| e.into_inner())
}

//! In-memory smoltcp device fed by the link endpoint.

use smoltcp::phy::{Device, DeviceCapabilities, RxToken, TxToken};
use smoltcp::time::Instant;
use std::collections::VecDeque;

pub struct GatewayDevice {
    rx: VecDeque<Vec<u8>>,
    tx: VecDeque<Vec<u8>>,
    caps: DeviceCapabilities,
}

impl GatewayDevice {
    pub fn new(caps: DeviceCapabilities) -> Self {
        Self {
            rx: VecDeque::new(),
            tx: VecDeque::new(),
            caps,
        }
    }

    /// Queues a frame for the next interface poll.
    pub fn inject_rx(&mut self, frame: Vec<u8>) {
        self.rx.push_back(frame);
    }

    /// Takes every frame the interface emitted since the last call.
    pub fn drain_tx(&mut self) -> Vec<Vec<u8>> {
        self.tx.drain(..).collect()
    }
}

pub struct GatewayRxToken(Vec<u8>);

impl RxToken for GatewayRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.0)
    }
}

pub struct GatewayTxToken<'a>(&'a mut VecDeque<Vec<u8>>);

impl TxToken for GatewayTxToken<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buf = vec![0u8; len];
        let r = f(&mut buf);
        self.0.push_back(buf);
        r
    }
}

impl Device for GatewayDevice {
    type RxToken<'a>
        = GatewayRxToken
    where
        Self: 'a;
    type TxToken<'a>
        = GatewayTxToken<'a>
    where
        Self: 'a;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let frame = self.rx.pop_front()?;
        Some((GatewayRxToken(frame), GatewayTxToken(&mut self.tx)))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(GatewayTxToken(&mut self.tx))
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.caps.clone()
    }
}

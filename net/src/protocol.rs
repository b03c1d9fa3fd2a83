//! Framing of Ethernet frames on client transports.
//!
//! Stream transports prefix every frame with its length (2 bytes little-endian
//! for hyperkit, 4 bytes big-endian for qemu). Datagram transports carry one
//! frame per datagram.

use crate::eth::ETH_HEADER_LEN;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixDatagram;

/// Read buffer used for datagram transports.
pub const DATAGRAM_BUF_SIZE: usize = 128 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Hyperkit,
    Qemu,
    Bess,
    Vfkit,
    Stdio,
}

impl Protocol {
    pub fn is_stream(&self) -> bool {
        !matches!(self, Protocol::Bess | Protocol::Vfkit)
    }

    /// Size of the length prefix for stream protocols.
    pub fn header_len(&self) -> usize {
        match self {
            Protocol::Qemu => 4,
            Protocol::Bess | Protocol::Vfkit => 0,
            Protocol::Hyperkit | Protocol::Stdio => 2,
        }
    }

    pub fn encode_header(&self, size: usize, buf: &mut [u8]) {
        match self {
            Protocol::Qemu => {
                let size = u32::try_from(size).unwrap_or_else(|_| {
                    tracing::warn!("size exceeds max limit. Resetting to: {}", u32::MAX);
                    u32::MAX
                });
                buf[..4].copy_from_slice(&size.to_be_bytes());
            }
            Protocol::Hyperkit | Protocol::Stdio => {
                let size = u16::try_from(size).unwrap_or_else(|_| {
                    tracing::warn!("size out of range. Resetting to {}", u16::MAX);
                    u16::MAX
                });
                buf[..2].copy_from_slice(&size.to_le_bytes());
            }
            Protocol::Bess | Protocol::Vfkit => {}
        }
    }

    pub fn decode_header(&self, buf: &[u8]) -> usize {
        match self {
            Protocol::Qemu => u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize,
            Protocol::Hyperkit | Protocol::Stdio => u16::from_le_bytes([buf[0], buf[1]]) as usize,
            Protocol::Bess | Protocol::Vfkit => 0,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Protocol::Hyperkit => "hyperkit",
            Protocol::Qemu => "qemu",
            Protocol::Bess => "bess",
            Protocol::Vfkit => "vfkit",
            Protocol::Stdio => "stdio",
        };
        f.write_str(name)
    }
}

#[async_trait]
pub trait FrameReader: Send {
    /// Reads the next frame. EOF is reported as `UnexpectedEof`.
    async fn read_frame(&mut self) -> io::Result<Vec<u8>>;
}

#[async_trait]
pub trait FrameWriter: Send {
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;

    async fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A message-oriented transport.
#[async_trait]
pub trait PacketConn: Send + Sync {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;
}

#[async_trait]
impl PacketConn for UnixDatagram {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        UnixDatagram::recv(self, buf).await
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        UnixDatagram::send(self, buf).await
    }
}

pub struct StreamFrameReader<R> {
    reader: BufReader<R>,
    protocol: Protocol,
    max_frame: usize,
}

impl<R: AsyncRead + Unpin + Send> StreamFrameReader<R> {
    /// Frames longer than `mtu` plus the Ethernet header are rejected with
    /// `InvalidData`.
    pub fn new(reader: R, protocol: Protocol, mtu: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            protocol,
            max_frame: mtu + ETH_HEADER_LEN,
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameReader for StreamFrameReader<R> {
    async fn read_frame(&mut self) -> io::Result<Vec<u8>> {
        let mut size_buf = [0u8; 4];
        let header = &mut size_buf[..self.protocol.header_len()];
        self.reader.read_exact(header).await?;
        let size = self.protocol.decode_header(header);
        if size > self.max_frame {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds the maximum of {}", size, self.max_frame),
            ));
        }

        let mut buf = vec![0u8; size];
        self.reader.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

pub struct StreamFrameWriter<W> {
    writer: W,
    protocol: Protocol,
}

impl<W: AsyncWrite + Unpin + Send> StreamFrameWriter<W> {
    pub fn new(writer: W, protocol: Protocol) -> Self {
        Self { writer, protocol }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameWriter for StreamFrameWriter<W> {
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        let header_len = self.protocol.header_len();
        let mut buf = vec![0u8; header_len + frame.len()];
        self.protocol.encode_header(frame.len(), &mut buf[..header_len]);
        buf[header_len..].copy_from_slice(frame);
        self.writer.write_all(&buf).await?;
        self.writer.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

pub struct DatagramFrameReader {
    conn: Arc<dyn PacketConn>,
    buf: Vec<u8>,
}

impl DatagramFrameReader {
    pub fn new(conn: Arc<dyn PacketConn>) -> Self {
        Self {
            conn,
            buf: vec![0u8; DATAGRAM_BUF_SIZE],
        }
    }
}

#[async_trait]
impl FrameReader for DatagramFrameReader {
    async fn read_frame(&mut self) -> io::Result<Vec<u8>> {
        let n = self.conn.recv(&mut self.buf).await?;
        Ok(self.buf[..n].to_vec())
    }
}

pub struct DatagramFrameWriter {
    conn: Arc<dyn PacketConn>,
}

impl DatagramFrameWriter {
    pub fn new(conn: Arc<dyn PacketConn>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl FrameWriter for DatagramFrameWriter {
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        loop {
            match self.conn.send(frame).await {
                Ok(_) => return Ok(()),
                // The socket buffer can be full; retry the same datagram.
                Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// A client connection to the switch.
pub struct Conn {
    pub reader: Box<dyn FrameReader>,
    pub writer: Box<dyn FrameWriter>,
    pub protocol: Protocol,
    pub peer: String,
}

impl Conn {
    /// Wraps a byte stream with length-prefixed framing.
    pub fn stream<S>(io: S, protocol: Protocol, mtu: usize, peer: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (r, w) = tokio::io::split(io);
        Self::from_halves(r, w, protocol, mtu, peer)
    }

    pub fn from_halves<R, W>(
        reader: R,
        writer: W,
        protocol: Protocol,
        mtu: usize,
        peer: impl Into<String>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            reader: Box::new(StreamFrameReader::new(reader, protocol, mtu)),
            writer: Box::new(StreamFrameWriter::new(writer, protocol)),
            protocol,
            peer: peer.into(),
        }
    }

    /// Wraps a datagram transport, one frame per message.
    pub fn datagram(conn: Arc<dyn PacketConn>, protocol: Protocol, peer: impl Into<String>) -> Self {
        Self {
            reader: Box::new(DatagramFrameReader::new(conn.clone())),
            writer: Box::new(DatagramFrameWriter::new(conn)),
            protocol,
            peer: peer.into(),
        }
    }
}

//! Client side of the station protocol, used by `kestrel-client` and the
//! integration tests.

use crate::dispatch::bind_discovery_socket;
use crate::error::{Result, StationError};
use crate::protocol::{
    DiscoveryCommand, KEYWORD_LEN, Keyword, LENGTH_FIELD_LEN, StreamCommand, encode_command,
    parse_length_field, split_body,
};
use bytes::Bytes;
use kestrel_core::MacAddress;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::{Instant, timeout};
use tracing::debug;

/// One decoded outbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub keyword: Keyword,
    pub payload: Bytes,
}

impl Frame {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// A station that answered a discovery broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredStation {
    pub addr: SocketAddr,
    pub name: String,
    pub tcp_port: u16,
    pub board: String,
}

impl DiscoveredStation {
    /// Parse a `BOARD_INFO__` payload: `name|port|board summary`.
    pub fn parse(addr: SocketAddr, payload: &str) -> Result<Self> {
        let mut parts = payload.splitn(3, '|');
        let name = parts.next().unwrap_or_default().to_string();
        let tcp_port = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| StationError::Protocol(format!("Bad board info: {payload:?}")))?;
        Ok(Self {
            addr,
            name,
            tcp_port,
            board: parts.next().unwrap_or_default().to_string(),
        })
    }

    pub fn stream_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr.ip(), self.tcp_port)
    }
}

/// Stream connection to a station.
pub struct StationClient {
    reader: FrameReader,
    writer: CommandWriter,
}

impl StationClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: FrameReader { read },
            writer: CommandWriter {
                write,
                terminator_len: 3,
            },
        })
    }

    pub fn with_terminator_len(mut self, terminator_len: usize) -> Self {
        self.writer.terminator_len = terminator_len;
        self
    }

    pub async fn send_command(&mut self, command: StreamCommand, argument: &str) -> Result<()> {
        self.writer.send_command(command, argument).await
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.send_raw(bytes).await
    }

    pub async fn read_frame(&mut self) -> Result<Frame> {
        self.reader.read_frame().await
    }

    pub async fn expect(&mut self, keyword: Keyword, wait: Duration) -> Result<Frame> {
        self.reader.expect(keyword, wait).await
    }

    /// Split into halves that can be driven from separate tasks.
    pub fn into_split(self) -> (FrameReader, CommandWriter) {
        (self.reader, self.writer)
    }
}

pub struct FrameReader {
    read: OwnedReadHalf,
}

impl FrameReader {
    /// Read one frame. Not cancel safe.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        let mut length = [0u8; LENGTH_FIELD_LEN];
        self.read.read_exact(&mut length).await?;
        let body_len = parse_length_field(&length)?;

        let mut body = vec![0u8; body_len];
        self.read.read_exact(&mut body).await?;
        let (keyword, payload) = split_body(&body)?;
        debug!("Received {} ({} bytes)", keyword.as_str(), payload.len());
        Ok(Frame {
            keyword,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    /// Read frames until one carries `keyword`, giving up after `wait`.
    pub async fn expect(&mut self, keyword: Keyword, wait: Duration) -> Result<Frame> {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = timeout(remaining, self.read_frame()).await.map_err(|_| {
                StationError::Protocol(format!("Timed out waiting for {}", keyword.as_str()))
            })??;
            if frame.keyword == keyword {
                return Ok(frame);
            }
            debug!("Skipping {} while waiting for {}", frame.keyword.as_str(), keyword.as_str());
        }
    }
}

pub struct CommandWriter {
    write: OwnedWriteHalf,
    terminator_len: usize,
}

impl CommandWriter {
    pub async fn send_command(&mut self, command: StreamCommand, argument: &str) -> Result<()> {
        let bytes = encode_command(command as u16, argument, self.terminator_len);
        self.send_raw(&bytes).await
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.write.write_all(bytes).await?;
        Ok(())
    }
}

fn discovery_datagram(command: DiscoveryCommand, mac: MacAddress, extra: &[&str]) -> Vec<u8> {
    let mut text = format!("{}\n{}", command as u16, mac);
    for line in extra {
        text.push('\n');
        text.push_str(line);
    }
    text.into_bytes()
}

/// Send one discovery datagram to `target` and collect the replies that arrive
/// within `wait`.
pub async fn discover(
    target: SocketAddr,
    command: DiscoveryCommand,
    mac: MacAddress,
    extra: &[&str],
    wait: Duration,
) -> Result<Vec<(SocketAddr, Frame)>> {
    let bind_ip = match target.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
    };
    let socket = bind_discovery_socket(SocketAddr::new(bind_ip, 0))?;
    socket
        .send_to(&discovery_datagram(command, mac, extra), target)
        .await?;

    let mut replies = Vec::new();
    if command == DiscoveryCommand::Disconnect {
        return Ok(replies);
    }

    let deadline = Instant::now() + wait;
    let mut buf = vec![0u8; 2048];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let Ok(received) = timeout(remaining, socket.recv_from(&mut buf)).await else {
            break;
        };
        let (len, from) = received?;
        if len < LENGTH_FIELD_LEN + KEYWORD_LEN {
            continue;
        }
        match split_body(&buf[LENGTH_FIELD_LEN..len]) {
            Ok((keyword, payload)) => replies.push((
                from,
                Frame {
                    keyword,
                    payload: Bytes::copy_from_slice(payload),
                },
            )),
            Err(e) => debug!("Ignoring reply from {}: {}", from, e),
        }
    }
    Ok(replies)
}

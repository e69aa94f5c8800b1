//! TCP raw transport over `std::net`.
//!
//! ESP-IDF exposes lwIP through the Rust standard library, so the same
//! adapter runs on the device and on the host (where the tests use loopback
//! sockets).
//!
//! Connect failures are classified for the caller's backoff policy:
//!
//! | cause                                  | result          |
//! |----------------------------------------|-----------------|
//! | name resolution failed / no addresses  | `HostUnknown`   |
//! | local resource exhaustion, socket setup| `SocketFailed`  |
//! | refused, unreachable, timed out, ...   | `ConnectFailed` |
//!
//! Resource exhaustion is recognised by errno (`EMFILE`, `ENFILE`,
//! `ENOBUFS`, `ENOMEM`): std reports the first two as an uncategorised
//! error kind.  On ESP-IDF `ENFILE` is what lwIP returns once
//! `CONFIG_LWIP_MAX_SOCKETS` sockets are open.
//!
//! Sends never block for longer than [`SEND_POLL_INTERVAL`]: a peer that
//! stops reading turns into `WouldBlock`, and the caller's deadline decides
//! when to give up.

use core::time::Duration;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};

use log::{debug, info, warn};

use crate::error::TransportConnectError;
use crate::ports::{BioError, RawConnection, RawTransport};

/// Default TCP connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest a single send may block on a full socket buffer.
pub const SEND_POLL_INTERVAL: Duration = Duration::from_millis(10);

const SOCKET_EXHAUSTION_ERRNOS: [i32; 4] = [libc::EMFILE, libc::ENFILE, libc::ENOBUFS, libc::ENOMEM];

/// Opens TCP connections.
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl RawTransport for TcpTransport {
    type Connection = TcpLink;

    fn connect(&mut self, host: &str, port: u16) -> Result<TcpLink, TransportConnectError> {
        let addrs: Vec<SocketAddr> = match (host, port).to_socket_addrs() {
            Ok(it) => it.collect(),
            Err(e) => {
                warn!("TCP: resolve '{}' failed: {}", host, e);
                return Err(TransportConnectError::HostUnknown);
            }
        };
        if addrs.is_empty() {
            warn!("TCP: '{}' resolved to no addresses", host);
            return Err(TransportConnectError::HostUnknown);
        }

        let mut last = TransportConnectError::ConnectFailed;
        for addr in &addrs {
            match TcpStream::connect_timeout(addr, self.connect_timeout) {
                Ok(stream) => {
                    let setup = stream
                        .set_nodelay(true)
                        .and_then(|()| stream.set_write_timeout(Some(SEND_POLL_INTERVAL)));
                    if let Err(e) = setup {
                        warn!("TCP: socket setup for {} failed: {}", addr, e);
                        return Err(TransportConnectError::SocketFailed);
                    }
                    info!("TCP: connected to {} ({})", host, addr);
                    return Ok(TcpLink::new(stream));
                }
                Err(e) => {
                    debug!("TCP: connect {} failed: {}", addr, e);
                    last = classify_connect_error(&e);
                    if last == TransportConnectError::SocketFailed {
                        break;
                    }
                }
            }
        }
        warn!("TCP: connect to {}:{} failed ({})", host, port, last);
        Err(last)
    }
}

fn classify_connect_error(e: &io::Error) -> TransportConnectError {
    if e.raw_os_error().is_some_and(|code| SOCKET_EXHAUSTION_ERRNOS.contains(&code)) {
        return TransportConnectError::SocketFailed;
    }
    match e.kind() {
        ErrorKind::OutOfMemory | ErrorKind::AddrNotAvailable => TransportConnectError::SocketFailed,
        _ => TransportConnectError::ConnectFailed,
    }
}

/// An open TCP connection.
pub struct TcpLink {
    stream: TcpStream,
    read_timeout: Option<Duration>,
    closed: bool,
}

impl TcpLink {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            read_timeout: None,
            closed: false,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }
}

impl RawConnection for TcpLink {
    fn send(&mut self, data: &[u8]) -> Result<usize, BioError> {
        if self.closed {
            return Err(BioError::Closed);
        }
        match self.stream.write(data) {
            Ok(0) if !data.is_empty() => Err(BioError::Closed),
            Ok(n) => Ok(n),
            // The send timeout elapsed with the socket buffer still full.
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                Err(BioError::WouldBlock)
            }
            Err(e) if matches!(e.kind(), ErrorKind::BrokenPipe | ErrorKind::ConnectionReset) => {
                Err(BioError::Closed)
            }
            Err(e) => {
                warn!("TCP: send failed: {}", e);
                Err(BioError::Failed)
            }
        }
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, BioError> {
        if self.closed {
            return Err(BioError::Closed);
        }
        let wanted = (!timeout.is_zero()).then_some(timeout);
        if wanted != self.read_timeout {
            self.stream.set_read_timeout(wanted).map_err(|e| {
                warn!("TCP: set_read_timeout failed: {}", e);
                BioError::Failed
            })?;
            self.read_timeout = wanted;
        }
        match self.stream.read(buf) {
            Ok(0) if !buf.is_empty() => Err(BioError::Closed),
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Err(BioError::Timeout)
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => Err(BioError::WouldBlock),
            Err(e) if e.kind() == ErrorKind::ConnectionReset => Err(BioError::Closed),
            Err(e) => {
                warn!("TCP: receive failed: {}", e);
                Err(BioError::Failed)
            }
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.stream.shutdown(Shutdown::Both);
        debug!("TCP: connection closed");
    }
}

//! TCP transport: acceptor, connect, read and write tasks.
//!
//! Each task owns one piece of socket I/O and reports its completion as an
//! [`Event`] on the reactor's channel. Tasks never touch participant state.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, trace, warn};

use crate::codec::{LENGTH_FIELD_SIZE, MAX_FRAME_LENGTH};
use crate::identity::ParticipantAddress;
use crate::message::OutboundMessage;
use crate::participant::{HandleId, TimerKind};

/// Work posted to the event loop from API threads.
#[derive(Debug)]
pub enum Command {
    Send(OutboundMessage),
    LogConnectionInfo,
    LogPeriodic,
}

/// Everything the reactor reacts to.
#[derive(Debug)]
pub enum Event {
    Posted(Command),
    Accepted {
        stream: TcpStream,
        remote: SocketAddr,
    },
    Connected {
        handle: HandleId,
        result: io::Result<TcpStream>,
    },
    /// A length prefix arrived; the body read is under way.
    HeaderRead {
        handle: HandleId,
        length: u32,
    },
    /// A complete frame body (everything after the length field).
    Received {
        handle: HandleId,
        body: Bytes,
    },
    ReadFailed {
        handle: HandleId,
        error: io::Error,
    },
    WriteDone {
        handle: HandleId,
        writer: OwnedWriteHalf,
        result: io::Result<()>,
    },
    TimerFired {
        handle: HandleId,
        kind: TimerKind,
        generation: u64,
    },
    ReconnectDue {
        address: ParticipantAddress,
        /// Redial the configured daemon instead of running the connect
        /// decision for `address`.
        configured_daemon: bool,
    },
}

pub type EventSender = mpsc::UnboundedSender<Event>;
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Map the textual address of a peer to an IP. `localhost` is the only
/// name resolved; anything else must already be a literal address.
pub fn resolve_ip(ip: &str) -> Option<IpAddr> {
    if ip == "localhost" {
        return Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
    ip.parse().ok()
}

/// Bind the listening socket on all interfaces.
///
/// Accepted sockets inherit the send buffer size set here.
pub fn open_acceptor(port: u16, send_buffer_size: usize) -> io::Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    if let Err(e) = socket.set_send_buffer_size(send_buffer_size as u32) {
        warn!("Cannot set send buffer size on acceptor: {e}");
    }
    socket.bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))?;
    let listener = socket.listen(1024)?;
    info!("Listening for connections on {}", listener.local_addr()?);
    Ok(listener)
}

/// Accept connections until aborted. Accept errors are logged and the
/// acceptor is re-armed.
pub fn spawn_acceptor(listener: TcpListener, events: EventSender, owner: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    if events.send(Event::Accepted { stream, remote }).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("ConnectionSystem({owner}): accept failed: {e}");
                }
            }
        }
    })
}

pub fn spawn_connect(
    handle: HandleId,
    target: SocketAddr,
    send_buffer_size: usize,
    events: EventSender,
) -> AbortHandle {
    tokio::spawn(async move {
        let result = connect(target, send_buffer_size).await;
        let _ = events.send(Event::Connected { handle, result });
    })
    .abort_handle()
}

async fn connect(target: SocketAddr, send_buffer_size: usize) -> io::Result<TcpStream> {
    let socket = match target {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    if let Err(e) = socket.set_send_buffer_size(send_buffer_size as u32) {
        debug!("Cannot set send buffer size for {target}: {e}");
    }
    socket.connect(target).await
}

/// Read frames until the socket fails. Every frame is reported as a
/// [`Event::HeaderRead`] followed by an [`Event::Received`].
pub fn spawn_reader(handle: HandleId, mut reader: OwnedReadHalf, events: EventSender) -> AbortHandle {
    tokio::spawn(async move {
        loop {
            let mut length = [0u8; LENGTH_FIELD_SIZE];
            if let Err(error) = reader.read_exact(&mut length).await {
                let _ = events.send(Event::ReadFailed { handle, error });
                return;
            }
            let length = u32::from_le_bytes(length);
            if length > MAX_FRAME_LENGTH {
                let error = io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("frame of {length} bytes exceeds limit of {MAX_FRAME_LENGTH}"),
                );
                let _ = events.send(Event::ReadFailed { handle, error });
                return;
            }
            trace!("handle {handle}: expecting {length} bytes");
            if events.send(Event::HeaderRead { handle, length }).is_err() {
                return;
            }

            let mut body = BytesMut::zeroed(length as usize);
            if let Err(error) = reader.read_exact(&mut body).await {
                let _ = events.send(Event::ReadFailed { handle, error });
                return;
            }
            let body = body.freeze();
            if events.send(Event::Received { handle, body }).is_err() {
                return;
            }
        }
    })
    .abort_handle()
}

/// Write one complete frame and hand the writer back.
pub fn spawn_writer(
    handle: HandleId,
    mut writer: OwnedWriteHalf,
    frame: Bytes,
    events: EventSender,
) -> AbortHandle {
    tokio::spawn(async move {
        let result = writer.write_all(&frame).await;
        let _ = events.send(Event::WriteDone {
            handle,
            writer,
            result,
        });
    })
    .abort_handle()
}

pub fn spawn_timer(
    handle: HandleId,
    kind: TimerKind,
    generation: u64,
    after: Duration,
    events: EventSender,
) -> AbortHandle {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        let _ = events.send(Event::TimerFired {
            handle,
            kind,
            generation,
        });
    })
    .abort_handle()
}

/// Re-evaluate `address` after `after`. Dies with the runtime on shutdown.
pub fn spawn_reconnect(
    address: ParticipantAddress,
    configured_daemon: bool,
    after: Duration,
    events: EventSender,
) {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        let _ = events.send(Event::ReconnectDue {
            address,
            configured_daemon,
        });
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_frame;

    #[test]
    fn test_resolve_ip() {
        assert_eq!(resolve_ip("localhost"), Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert_eq!(resolve_ip("10.1.2.3"), Some("10.1.2.3".parse().unwrap()));
        assert_eq!(resolve_ip("::1"), Some("::1".parse().unwrap()));
        assert_eq!(resolve_ip("not-an-ip"), None);
        assert_eq!(resolve_ip(""), None);
    }

    #[tokio::test]
    async fn test_acceptor_connect_read_write() {
        let listener = open_acceptor(0, 64 * 1024).unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let acceptor = spawn_acceptor(listener, tx.clone(), "test".into());

        let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        spawn_connect(1, target, 64 * 1024, tx.clone());

        let mut client = None;
        let mut server = None;
        while client.is_none() || server.is_none() {
            match rx.recv().await.unwrap() {
                Event::Connected { handle, result } => {
                    assert_eq!(handle, 1);
                    client = Some(result.unwrap());
                }
                Event::Accepted { stream, .. } => server = Some(stream),
                other => panic!("unexpected event {other:?}"),
            }
        }

        let (server_read, _server_write) = server.unwrap().into_split();
        spawn_reader(2, server_read, tx.clone());
        let (_client_read, client_write) = client.unwrap().into_split();
        spawn_writer(1, client_write, encode_frame(1, 0, b"abc"), tx.clone());

        let mut got_header = false;
        loop {
            match rx.recv().await.unwrap() {
                Event::WriteDone { handle, result, .. } => {
                    assert_eq!(handle, 1);
                    result.unwrap();
                }
                Event::HeaderRead { handle, length } => {
                    assert_eq!(handle, 2);
                    assert_eq!(length, 11);
                    got_header = true;
                }
                Event::Received { handle, body } => {
                    assert_eq!(handle, 2);
                    assert!(got_header);
                    assert_eq!(&body[8..], b"abc");
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        acceptor.abort();
    }

    #[tokio::test]
    async fn test_oversized_frame_length_fails_the_read() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (server_read, _server_write) = server.into_split();
        spawn_reader(4, server_read, tx);
        client.write_all(&u32::MAX.to_le_bytes()).await.unwrap();

        match rx.recv().await.unwrap() {
            Event::ReadFailed { handle, error } => {
                assert_eq!(handle, 4);
                assert_eq!(error.kind(), io::ErrorKind::InvalidData);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_refused_reports_error() {
        // bind then drop to get a port nobody listens on
        let port = {
            let l = open_acceptor(0, 4096).unwrap();
            l.local_addr().unwrap().port()
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_connect(7, SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port), 4096, tx);
        match rx.recv().await.unwrap() {
            Event::Connected { handle, result } => {
                assert_eq!(handle, 7);
                assert!(result.is_err());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timer_fires_with_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_timer(3, TimerKind::SendAlive, 42, Duration::from_millis(5), tx);
        match rx.recv().await.unwrap() {
            Event::TimerFired {
                handle,
                kind,
                generation,
            } => {
                assert_eq!((handle, kind, generation), (3, TimerKind::SendAlive, 42));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}

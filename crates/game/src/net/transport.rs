use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, StreamOwned};

use super::protocol::{FrameDecoder, Message};
use super::verifier::PinnedCertVerifier;

const READ_CHUNK: usize = 8192;
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Parameters for upgrading the stream to an encrypted channel.
#[derive(Debug, Clone)]
pub struct TlsParams {
    pub server_name: String,
    /// Hex SHA-256 pin of the server certificate.
    pub fingerprint: String,
}

#[derive(Debug)]
pub enum TransportEvent {
    /// The encrypted channel finished negotiating. Only emitted for
    /// secure connections.
    CryptoEstablished,
    Message(Message),
    Closed { reason: String },
}

/// A framed byte-stream connection to one server. All socket I/O happens
/// on a background thread; inbound messages queue on a channel the owner
/// drains once per tick, so the owner never blocks.
pub struct Transport {
    peer_addr: SocketAddr,
    secure: bool,
    outbound: Sender<Vec<u8>>,
    inbound: Receiver<TransportEvent>,
    shutdown: Arc<AtomicBool>,
    stream: TcpStream,
    io_thread: Option<JoinHandle<()>>,
}

impl Transport {
    /// Connect to `host:port`, optionally upgrading to TLS, and start the
    /// background reader. Connect establishment is bounded by `timeout`;
    /// a TLS handshake completes asynchronously and is reported through
    /// `TransportEvent::CryptoEstablished`.
    pub fn open(
        host: &str,
        port: u16,
        timeout: Duration,
        tls: Option<TlsParams>,
    ) -> io::Result<Self> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host resolved to no address"))?;

        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(POLL_INTERVAL))?;
        let peer_addr = stream.peer_addr()?;

        let (out_tx, out_rx) = unbounded();
        let (in_tx, in_rx) = unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));

        let io_stream = stream.try_clone()?;
        let flag = Arc::clone(&shutdown);
        let secure = tls.is_some();
        let io_thread = thread::Builder::new()
            .name("transport-io".to_string())
            .spawn(move || io_loop(io_stream, tls, out_rx, in_tx, flag))?;

        Ok(Self {
            peer_addr,
            secure,
            outbound: out_tx,
            inbound: in_rx,
            shutdown,
            stream,
            io_thread: Some(io_thread),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Queue a message for transmission. Frames queued before a TLS
    /// handshake completes are sent once it does.
    pub fn send(&self, message: &Message) -> io::Result<()> {
        let frame = message
            .to_frame()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
        self.outbound
            .send(frame)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "transport thread stopped"))
    }

    /// Drain every event received since the last call, in arrival order.
    pub fn drain_events(&self) -> Vec<TransportEvent> {
        self.inbound.try_iter().collect()
    }

    /// Tear the connection down. Outstanding inbound events are dropped
    /// with the channel; pending outbound frames are abandoned.
    pub fn close(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(handle) = self.io_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

fn io_loop(
    stream: TcpStream,
    tls: Option<TlsParams>,
    out_rx: Receiver<Vec<u8>>,
    in_tx: Sender<TransportEvent>,
    shutdown: Arc<AtomicBool>,
) {
    let result = match tls {
        Some(params) => match establish_tls(stream, &params, &shutdown) {
            Ok(mut tls_stream) => {
                let _ = in_tx.send(TransportEvent::CryptoEstablished);
                pump(&mut tls_stream, &out_rx, &in_tx, &shutdown)
            }
            Err(err) => Err(err),
        },
        None => {
            let mut stream = stream;
            pump(&mut stream, &out_rx, &in_tx, &shutdown)
        }
    };

    let reason = match result {
        Ok(()) => "connection closed".to_string(),
        Err(err) => err.to_string(),
    };
    let _ = in_tx.send(TransportEvent::Closed { reason });
}

fn establish_tls(
    stream: TcpStream,
    params: &TlsParams,
    shutdown: &AtomicBool,
) -> io::Result<StreamOwned<ClientConnection, TcpStream>> {
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(PinnedCertVerifier::new(&params.fingerprint))
        .with_no_client_auth();

    let name = ServerName::try_from(params.server_name.clone())
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
    let conn = ClientConnection::new(Arc::new(config), name).map_err(io::Error::other)?;
    let mut tls = StreamOwned::new(conn, stream);

    while tls.conn.is_handshaking() {
        if shutdown.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "closed during channel negotiation",
            ));
        }
        match tls.conn.complete_io(&mut tls.sock) {
            Ok(_) => {}
            Err(err) if would_block(&err) => {}
            Err(err) => return Err(err),
        }
    }

    Ok(tls)
}

fn pump<S: Read + Write>(
    stream: &mut S,
    out_rx: &Receiver<Vec<u8>>,
    in_tx: &Sender<TransportEvent>,
    shutdown: &AtomicBool,
) -> io::Result<()> {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; READ_CHUNK];

    loop {
        if shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }

        loop {
            match out_rx.try_recv() {
                Ok(frame) => stream.write_all(&frame)?,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Ok(()),
            }
        }

        match stream.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => {
                decoder.extend(&buf[..n]);
                loop {
                    match decoder.next_frame() {
                        Ok(Some(message)) => {
                            if in_tx.send(TransportEvent::Message(message)).is_err() {
                                return Ok(());
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                err.to_string(),
                            ));
                        }
                    }
                }
            }
            Err(err) if would_block(&err) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
}

fn would_block(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Instant;

    fn read_frame(stream: &mut TcpStream) -> Message {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).unwrap();
        let len = u32::from_le_bytes(header) as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).unwrap();
        Message::from_payload(&payload).unwrap()
    }

    fn drain_until_message(transport: &Transport, timeout_ms: u64) -> Option<Message> {
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(timeout_ms) {
            for event in transport.drain_events() {
                if let TransportEvent::Message(message) = event {
                    return Some(message);
                }
            }
            thread::sleep(Duration::from_millis(1));
        }
        None
    }

    #[test]
    fn test_plain_frame_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            match read_frame(&mut stream) {
                Message::KeepaliveProbe { id } => {
                    let reply = Message::KeepaliveReply { id }.to_frame().unwrap();
                    stream.write_all(&reply).unwrap();
                }
                other => panic!("expected probe, got {:?}", other),
            }
        });

        let mut transport =
            Transport::open("127.0.0.1", addr.port(), Duration::from_secs(2), None).unwrap();
        assert!(!transport.is_secure());
        transport.send(&Message::KeepaliveProbe { id: 9 }).unwrap();

        let reply = drain_until_message(&transport, 2000).expect("no reply received");
        assert_eq!(reply, Message::KeepaliveReply { id: 9 });

        server.join().unwrap();
        transport.close();
    }

    #[test]
    fn test_peer_close_reports_closed_event() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });

        let transport =
            Transport::open("127.0.0.1", addr.port(), Duration::from_secs(2), None).unwrap();
        server.join().unwrap();

        let start = Instant::now();
        let mut closed = false;
        while start.elapsed() < Duration::from_secs(2) && !closed {
            closed = transport
                .drain_events()
                .iter()
                .any(|event| matches!(event, TransportEvent::Closed { .. }));
            thread::sleep(Duration::from_millis(5));
        }
        assert!(closed);
    }

    #[test]
    fn test_connect_refused_is_an_error() {
        // Port 1 on loopback is refused immediately on any sane host.
        let result = Transport::open("127.0.0.1", 1, Duration::from_secs(2), None);
        assert!(result.is_err());
    }
}

//! svcmux Echo Server
//!
//! Line-framed TCP echo service driven through the svcmux dispatch core.
//! The listener is a rendezvous endpoint served inline on the dispatch
//! thread; every accepted connection becomes a connection endpoint with its
//! own lazily-created worker.
//!
//! Usage:
//!     cargo build --release -p svcmux-echo
//!     ./target/release/svcmux-echo [port]
//!
//! Test with:
//!     # Correctness:
//!     echo "hello" | nc -q1 localhost 9999
//!
//!     # Concurrency (each connection gets its own worker):
//!     for i in $(seq 1 50); do echo "ping $i" | nc -q1 localhost 9999 & done
//!
//!     # Single-threaded baseline:
//!     SVCMUX_MODE=single ./target/release/svcmux-echo

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{error, info, warn};

use svcmux_core::processor::RequestProcessor;
use svcmux_core::registry::TransportRegistry;
use svcmux_core::transport::{Transport, TransportClass, TransportStatus};
use svcmux_runtime::{crash, DispatchConfig, Dispatcher, SharedRegistry};

const DEFAULT_PORT: u16 = 9999;

/// The listening socket, registered as a rendezvous endpoint so readiness
/// means "a connection is waiting to be accepted".
struct ListenerEndpoint {
    listener: TcpListener,
    fd: RawFd,
}

impl ListenerEndpoint {
    fn bind(port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        let fd = listener.as_raw_fd();
        Ok(Self { listener, fd })
    }

    /// Accept everything pending and register each connection.
    fn accept_ready(&self, registry: &SharedRegistry) -> bool {
        let mut accepted = false;
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => match StreamEndpoint::new(stream) {
                    Ok(endpoint) => {
                        info!(
                            "accepted {} as descriptor {}",
                            peer,
                            endpoint.descriptor()
                        );
                        registry.register(Arc::new(endpoint));
                        accepted = true;
                    }
                    Err(err) => warn!("could not set up connection from {}: {}", peer, err),
                },
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!("accept failed: {}", err);
                    break;
                }
            }
        }
        accepted
    }
}

impl Transport for ListenerEndpoint {
    fn descriptor(&self) -> RawFd {
        self.fd
    }

    fn class(&self) -> TransportClass {
        TransportClass::Rendezvous
    }

    fn status(&self) -> TransportStatus {
        TransportStatus::Idle
    }

    fn receive(&self, _frame: &mut Vec<u8>) -> bool {
        false
    }

    fn reply(&self, _frame: &[u8]) -> bool {
        false
    }
}

/// One accepted connection. Requests are newline-framed.
struct StreamEndpoint {
    stream: Mutex<TcpStream>,
    pending: Mutex<Vec<u8>>,
    dead: AtomicBool,
    fd: RawFd,
}

impl StreamEndpoint {
    fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        let fd = stream.as_raw_fd();
        Ok(Self {
            stream: Mutex::new(stream),
            pending: Mutex::new(Vec::new()),
            dead: AtomicBool::new(false),
            fd,
        })
    }

    /// Pull one complete line out of the pending buffer, if any.
    fn take_line(pending: &mut Vec<u8>, frame: &mut Vec<u8>) -> bool {
        let Some(end) = pending.iter().position(|&b| b == b'\n') else {
            return false;
        };
        frame.clear();
        frame.extend(pending.drain(..=end));
        frame.pop(); // newline
        if frame.last() == Some(&b'\r') {
            frame.pop();
        }
        true
    }
}

impl Transport for StreamEndpoint {
    fn descriptor(&self) -> RawFd {
        self.fd
    }

    fn class(&self) -> TransportClass {
        TransportClass::Connection
    }

    fn status(&self) -> TransportStatus {
        if self.dead.load(Ordering::SeqCst) {
            TransportStatus::Dead
        } else if self.pending.lock().unwrap().contains(&b'\n') {
            TransportStatus::MoreInput
        } else {
            TransportStatus::Idle
        }
    }

    fn receive(&self, frame: &mut Vec<u8>) -> bool {
        let mut pending = self.pending.lock().unwrap();
        if Self::take_line(&mut pending, frame) {
            return true;
        }

        let mut stream = self.stream.lock().unwrap();
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => {
                    self.dead.store(true, Ordering::SeqCst);
                    break;
                }
                Ok(n) => pending.extend_from_slice(&buf[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.dead.store(true, Ordering::SeqCst);
                    break;
                }
            }
        }

        Self::take_line(&mut pending, frame)
    }

    fn reply(&self, frame: &[u8]) -> bool {
        let mut stream = self.stream.lock().unwrap();
        let sent = stream.write_all(frame).is_ok() && stream.write_all(b"\n").is_ok();
        if !sent {
            self.dead.store(true, Ordering::SeqCst);
        }
        sent
    }
}

/// Receive → echo → reply for one ready descriptor.
struct EchoProcessor {
    registry: Arc<SharedRegistry>,
    listener: Arc<ListenerEndpoint>,
}

impl RequestProcessor for EchoProcessor {
    fn process(&self, descriptor: RawFd) -> bool {
        if descriptor == self.listener.descriptor() {
            return self.listener.accept_ready(&self.registry);
        }

        let Some(transport) = self.registry.lookup(descriptor) else {
            return false;
        };

        let mut frame = Vec::new();
        let mut handled = false;
        while transport.receive(&mut frame) {
            handled = true;
            if !transport.reply(&frame) {
                break;
            }
        }

        if transport.status().is_dead() {
            info!("peer on descriptor {} disconnected", descriptor);
            self.registry.unregister(descriptor);
        }
        handled
    }
}

fn main() -> io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    crash::install_panic_reporting();

    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let registry = Arc::new(SharedRegistry::new());
    let listener = Arc::new(ListenerEndpoint::bind(port)?);
    registry.register(Arc::clone(&listener) as Arc<dyn Transport>);

    let processor = Arc::new(EchoProcessor {
        registry: Arc::clone(&registry),
        listener: Arc::clone(&listener),
    });

    let mut dispatcher = Dispatcher::new(
        DispatchConfig::from_env(),
        Arc::clone(&registry) as Arc<dyn TransportRegistry>,
        processor as Arc<dyn RequestProcessor>,
    )
    .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;

    let _signal_watcher = crash::watch_stop_signals(dispatcher.control())?;

    info!("svcmux-echo listening on port {}", port);
    match dispatcher.run_supervised() {
        Ok(()) => info!("dispatch loop ended, shutting down"),
        Err(err) => {
            error!("dispatch loop failed: {}", err);
            std::process::exit(1);
        }
    }
    Ok(())
}

//! Whole-message TCP link.
//!
//! One `send` is one message; one `recv` returns whatever a single read
//! delivered, up to the packet size. There is no framing on the wire.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, trace};

use super::error::RelayError;

/// Bidirectional message channel used by both relay engines.
pub trait MessageLink: Send {
    /// Send one message.
    fn send(&mut self, text: &str) -> Result<(), RelayError>;

    /// Receive one message.
    ///
    /// `Ok(None)` when the read timed out, `Ok(Some(""))` when the peer
    /// delivered nothing (closed its side).
    fn recv(&mut self) -> Result<Option<String>, RelayError>;

    /// Close the link. Further calls fail with `NotConnected`.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// [`MessageLink`] over a `TcpStream` with a read timeout.
pub struct TcpLink {
    stream: Option<TcpStream>,
    peer: String,
    packet_max: usize,
}

impl TcpLink {
    /// Connect to `addr` with the given receive timeout.
    pub fn connect<A: ToSocketAddrs>(
        addr: A,
        recv_timeout: Duration,
        packet_max: usize,
    ) -> Result<Self, RelayError> {
        let stream = TcpStream::connect(addr)?;
        Self::from_stream(stream, recv_timeout, packet_max)
    }

    /// Wrap an accepted stream.
    pub fn from_stream(
        stream: TcpStream,
        recv_timeout: Duration,
        packet_max: usize,
    ) -> Result<Self, RelayError> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(non_zero(recv_timeout))?;
        stream.set_write_timeout(Some(Duration::from_secs(10)))?;
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".to_string());
        debug!(peer = %peer, "TCP link open");
        Ok(Self {
            stream: Some(stream),
            peer,
            packet_max,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    fn stream(&mut self) -> Result<&mut TcpStream, RelayError> {
        self.stream.as_mut().ok_or(RelayError::NotConnected)
    }
}

impl MessageLink for TcpLink {
    fn send(&mut self, text: &str) -> Result<(), RelayError> {
        let stream = self.stream()?;
        stream.write_all(text.as_bytes())?;
        stream.flush()?;
        trace!(len = text.len(), "TCP TX");
        Ok(())
    }

    fn recv(&mut self) -> Result<Option<String>, RelayError> {
        let mut buf = vec![0u8; self.packet_max];
        let stream = self.stream()?;
        match stream.read(&mut buf) {
            Ok(n) => {
                trace!(len = n, "TCP RX");
                Ok(Some(String::from_utf8_lossy(&buf[..n]).into_owned()))
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            debug!(peer = %self.peer, "TCP link closed");
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for TcpLink {
    fn drop(&mut self) {
        self.close();
    }
}

/// `set_read_timeout` rejects a zero duration.
fn non_zero(timeout: Duration) -> Option<Duration> {
    if timeout.is_zero() {
        Some(Duration::from_millis(1))
    } else {
        Some(timeout)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Default)]
    struct Script {
        incoming: VecDeque<Option<String>>,
        sent: Vec<String>,
        open: bool,
    }

    /// In-memory link: replies come from a script, sends are captured.
    #[derive(Clone)]
    pub struct ScriptedLink {
        script: Arc<Mutex<Script>>,
    }

    impl ScriptedLink {
        pub fn new() -> Self {
            Self {
                script: Arc::new(Mutex::new(Script {
                    open: true,
                    ..Script::default()
                })),
            }
        }

        pub fn push(&self, text: &str) {
            self.script
                .lock()
                .unwrap()
                .incoming
                .push_back(Some(text.to_string()));
        }

        pub fn push_timeout(&self) {
            self.script.lock().unwrap().incoming.push_back(None);
        }

        pub fn sent(&self) -> Vec<String> {
            self.script.lock().unwrap().sent.clone()
        }
    }

    impl MessageLink for ScriptedLink {
        fn send(&mut self, text: &str) -> Result<(), RelayError> {
            let mut script = self.script.lock().unwrap();
            if !script.open {
                return Err(RelayError::NotConnected);
            }
            script.sent.push(text.to_string());
            Ok(())
        }

        /// An exhausted script reads as a closed peer.
        fn recv(&mut self) -> Result<Option<String>, RelayError> {
            let mut script = self.script.lock().unwrap();
            if !script.open {
                return Err(RelayError::NotConnected);
            }
            Ok(script
                .incoming
                .pop_front()
                .unwrap_or_else(|| Some(String::new())))
        }

        fn close(&mut self) {
            self.script.lock().unwrap().open = false;
        }

        fn is_open(&self) -> bool {
            self.script.lock().unwrap().open
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_tcp_link_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpLink::connect(addr, Duration::from_millis(200), 1024).unwrap();
        let (stream, _) = listener.accept().unwrap();
        let mut server = TcpLink::from_stream(stream, Duration::from_millis(200), 1024).unwrap();

        server.send("STE_REQ").unwrap();
        assert_eq!(client.recv().unwrap().as_deref(), Some("STE_REQ"));

        // nothing pending: timeout
        assert_eq!(client.recv().unwrap(), None);

        server.close();
        assert_eq!(client.recv().unwrap().as_deref(), Some(""));
        assert!(matches!(server.send("x"), Err(RelayError::NotConnected)));
    }
}

//! TCP byte channel to a network-attached bridge.

use socket2::SockRef;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;
use tracing::{debug, info};

use super::{Transport, TransportError};

const RECV_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Debug)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    rx: Vec<u8>,
    scratch: Vec<u8>,
    peer_closed: bool,
}

impl TcpTransport {
    /// Connect with no-delay set and a 1MB receive buffer
    pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, TransportError> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;

        let sock_ref = SockRef::from(&stream);
        sock_ref.set_recv_buffer_size(RECV_BUFFER_SIZE)?;
        info!("Connected to bridge at {}", addr);

        Ok(Self { stream: Some(stream), rx: Vec::new(), scratch: vec![0; 64 * 1024], peer_closed: false })
    }

    fn stream(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::Closed)
    }

    /// Move whatever the socket holds into the receive buffer without blocking
    fn poll(&mut self) -> Result<(), TransportError> {
        if self.peer_closed {
            return Ok(());
        }
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        stream.set_nonblocking(true)?;
        let result = loop {
            match stream.read(&mut self.scratch) {
                Ok(0) => {
                    self.peer_closed = true;
                    break Ok(());
                }
                Ok(n) => self.rx.extend_from_slice(&self.scratch[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => break Err(e.into()),
            }
        };
        stream.set_nonblocking(false)?;
        result
    }
}

impl Transport for TcpTransport {
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.stream()?.write_all(data)?;
        Ok(())
    }

    fn read(&mut self, max: usize) -> Result<Vec<u8>, TransportError> {
        if self.rx.len() < max {
            self.poll()?;
        }
        if self.rx.is_empty() && self.peer_closed {
            return Err(TransportError::Closed);
        }
        let n = max.min(self.rx.len());
        Ok(self.rx.drain(..n).collect())
    }

    fn available(&mut self) -> Result<usize, TransportError> {
        self.poll()?;
        if self.rx.is_empty() && self.peer_closed {
            return Err(TransportError::Closed);
        }
        Ok(self.rx.len())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if let Some(stream) = self.stream.take() {
            debug!("Closing bridge connection");
            stream.shutdown(Shutdown::Both)?;
        }
        Ok(())
    }
}

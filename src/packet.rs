use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::SendError;
use crate::event_loop::EventFd;

/// A single UDP datagram with its remote peer address.
#[derive(Debug, Clone)]
pub struct Datagram {
    /// Remote address: the source on receive, the destination on send.
    pub peer: SocketAddr,
    /// Payload bytes.
    pub payload: Bytes,
}

/// Sink for datagrams delivered by the event loop.
///
/// Receiver ports invoke the writer on the loop thread, so implementations
/// must not block; hand the datagram off and return.
pub trait DatagramWriter: Send + Sync {
    fn write(&self, datagram: Datagram);
}

/// Outbound datagram queued for a sender port.
pub(crate) struct Outbound {
    pub(crate) port_index: u32,
    pub(crate) generation: u32,
    pub(crate) datagram: Datagram,
}

/// Handle for publishing outbound datagrams through a sender port.
///
/// Returned by [`EventLoop::add_udp_sender`](crate::EventLoop::add_udp_sender).
/// Clonable and usable from any thread; valid until `remove_port` returns for
/// the owning port, after which sends fail with [`SendError::PortClosed`].
#[derive(Debug, Clone)]
pub struct DatagramSender {
    pub(crate) tx: crossbeam_channel::Sender<Outbound>,
    pub(crate) wakeup: Arc<EventFd>,
    pub(crate) port_index: u32,
    pub(crate) generation: u32,
}

impl DatagramSender {
    /// Queue a datagram for transmission and wake the loop thread.
    ///
    /// The datagram is sent from the port's bound address to `datagram.peer`.
    pub fn send(&self, datagram: Datagram) -> Result<(), SendError> {
        self.tx
            .send(Outbound {
                port_index: self.port_index,
                generation: self.generation,
                datagram,
            })
            .map_err(|_| SendError::PortClosed)?;
        self.wakeup.signal();
        Ok(())
    }
}

impl DatagramWriter for DatagramSender {
    fn write(&self, datagram: Datagram) {
        if self.send(datagram).is_err() {
            log::warn!("sender port: dropping datagram, loop is gone");
        }
    }
}

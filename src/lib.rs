//! packetline — io_uring-native UDP port event loop for real-time streaming.
//!
//! packetline owns a set of UDP endpoints ("ports") behind a single loop
//! thread built directly on io_uring. The loop thread is the only code that
//! touches OS handles; application threads add and remove ports, publish
//! outbound datagrams, and resolve endpoint addresses through a synchronous
//! task protocol that parks the caller until the loop completes the work.
//! Port teardown is asynchronous under the hood — in-flight kernel
//! operations drain before a socket is recycled — but `remove_port` hides
//! that and only returns once the port is fully gone.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use packetline::{
//!     Config, Datagram, DatagramWriter, EventLoop, UdpReceiverConfig, UdpSenderConfig,
//! };
//!
//! struct Print;
//!
//! impl DatagramWriter for Print {
//!     fn write(&self, datagram: Datagram) {
//!         println!("{} bytes from {}", datagram.payload.len(), datagram.peer);
//!     }
//! }
//!
//! fn main() -> Result<(), packetline::Error> {
//!     let event_loop = EventLoop::start(Config::default())?;
//!
//!     let mut receiver = UdpReceiverConfig {
//!         bind_address: "127.0.0.1:0".parse().unwrap(),
//!     };
//!     let handle = event_loop
//!         .add_udp_receiver(&mut receiver, Arc::new(Print))
//!         .expect("bind receiver");
//!
//!     let mut sender = UdpSenderConfig::default();
//!     let (_sender_handle, writer) = event_loop
//!         .add_udp_sender(&mut sender)
//!         .expect("bind sender");
//!     writer
//!         .send(Datagram {
//!             peer: receiver.bind_address,
//!             payload: b"hello".as_ref().into(),
//!         })
//!         .unwrap();
//!
//!     event_loop.remove_port(handle);
//!     Ok(())
//! }
//! ```
//!
//! # Platform
//!
//! Linux 6.0+ only. Requires io_uring with registered file tables,
//! single-issuer mode, and deferred task running.

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod completion;
pub(crate) mod event_loop;
pub(crate) mod metrics;
pub(crate) mod packet;
pub(crate) mod port;
pub(crate) mod resolver;
pub(crate) mod ring;

// ── Public modules ──────────────────────────────────────────────────────
pub mod config;
pub mod error;

// ── Re-exports ──────────────────────────────────────────────────────────

/// Runtime configuration.
pub use config::Config;
/// Builder for [`Config`] with discoverable methods and `build()` validation.
pub use config::ConfigBuilder;
/// Configuration for a UDP receiver port.
pub use config::UdpReceiverConfig;
/// Configuration for a UDP sender port.
pub use config::UdpSenderConfig;
/// Runtime errors.
pub use error::Error;
/// Errors returned when publishing an outbound datagram.
pub use error::SendError;
/// The event loop owning all ports.
pub use event_loop::EventLoop;
/// A single UDP datagram with its remote peer address.
pub use packet::Datagram;
/// Handle for publishing outbound datagrams through a sender port.
pub use packet::DatagramSender;
/// Sink trait for datagrams delivered by the event loop.
pub use packet::DatagramWriter;
/// Opaque handle for a port managed by the event loop.
pub use port::PortHandle;
/// Parsed `scheme://host:port` endpoint URI.
pub use resolver::EndpointUri;

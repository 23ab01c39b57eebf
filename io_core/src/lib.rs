//! I/O core for a single-threaded cooperative async runtime: transports, protocols, and
//! the payload-stream consumer surface that sits between raw fd readiness and the
//! higher-level server/client code built on top of it.
//!
//! Everything in this crate is deliberately `!Send`: transports, protocols, and payload
//! streams are `Rc`/`RefCell`-based and expected to be driven from a single
//! `tokio::task::LocalSet`, mirroring the single-threaded event-loop model this crate is
//! modeled on. Cross-thread work belongs one layer up, handed off through channels.

pub mod config;
pub mod error;
pub mod event_loop;
pub mod extra_info;
pub mod flow_control;
pub mod payload_stream;
pub mod protocol;
pub mod ssl;
pub mod subprocess;
pub mod transport;

pub use config::Config;
pub use error::{ConnectionError, ConnectionErrorKind, IoCoreError, StreamStateError, TlsError};
pub use event_loop::EventLoopHandle;
pub use extra_info::ExtraInfo;
pub use flow_control::{FlowControl, NoopFlowControl};
pub use payload_stream::PayloadStream;
pub use protocol::{AbstractProtocol, AbstractTransport, ReadProtocol, ReadWriteProtocol};

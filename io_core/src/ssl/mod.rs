//! TLS transport layer (§4.7-§4.8): a `rustls` state machine (`pipe`) plus the
//! bidirectional transport (`bidirectional`) that backs a plaintext protocol with an
//! encrypted stream socket.

pub mod bidirectional;
pub mod pipe;

pub use bidirectional::SslBidirectionalTransport;
pub use pipe::{SslPipe, SslRole};

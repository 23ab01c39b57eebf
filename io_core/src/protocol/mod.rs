pub mod boundary_scan;
pub mod datagram;
pub mod read;
pub mod read_write;
pub mod traits;

pub use read::ReadProtocol;
pub use read_write::ReadWriteProtocol;
pub use traits::{AbstractProtocol, AbstractTransport};

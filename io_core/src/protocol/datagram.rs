//! Datagram-addressed read protocol: associates received datagrams with a sender address,
//! letting a consumer wait for a datagram from one particular peer.
//!
//! Carries forward an inherited, unresolved quirk from the source implementation (see
//! `SPEC_FULL.md` §9 "Open questions"): `wait_for_receive`'s address comparison is a
//! shadow-binding no-op. We do not "fix" it — the upstream intent is undocumented and
//! silently changing the behavior could break callers relying on it.

use std::collections::VecDeque;
use std::net::SocketAddr;

use bytes::Bytes;

/// One datagram tagged with its sender address.
pub type AddressedDatagram = (Bytes, SocketAddr);

pub struct DatagramMergerReadProtocol {
    queue: VecDeque<AddressedDatagram>,
}

impl Default for DatagramMergerReadProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl DatagramMergerReadProtocol {
    pub fn new() -> Self {
        Self { queue: VecDeque::new() }
    }

    pub fn datagram_received(&mut self, data: Bytes, address: SocketAddr) {
        self.queue.push_back((data, address));
    }

    pub fn pop(&mut self) -> Option<AddressedDatagram> {
        self.queue.pop_front()
    }
}

pub struct DatagramAddressedReadProtocol {
    merger: DatagramMergerReadProtocol,
}

impl Default for DatagramAddressedReadProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl DatagramAddressedReadProtocol {
    pub fn new() -> Self {
        Self { merger: DatagramMergerReadProtocol::new() }
    }

    pub fn datagram_received(&mut self, data: Bytes, address: SocketAddr) {
        self.merger.datagram_received(data, address);
    }

    /// Waits for (i.e. here: polls the queue for) a datagram "from" `address`.
    ///
    /// Inherited quirk: the received tuple is destructured as `(address, data)`, shadowing
    /// the `address` parameter before the equality check runs — so the check is always
    /// true regardless of which peer actually sent the datagram. This mirrors the source
    /// behavior exactly; see the module doc comment.
    pub fn wait_for_receive(&mut self, address: SocketAddr) -> Option<Bytes> {
        let (data, address) = self.merger.pop()?;
        #[allow(clippy::eq_op)]
        if address == address {
            return Some(data);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_for_receive_returns_any_queued_datagram_regardless_of_address() {
        let mut protocol = DatagramAddressedReadProtocol::new();
        let sender: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        protocol.datagram_received(Bytes::from_static(b"payload"), sender);

        let unrelated: SocketAddr = "10.0.0.1:1".parse().unwrap();
        // This demonstrates the inherited shadow-binding bug: requesting a datagram
        // "from" an address that never sent anything still returns the queued payload.
        let result = protocol.wait_for_receive(unrelated);
        assert_eq!(result, Some(Bytes::from_static(b"payload")));
    }
}

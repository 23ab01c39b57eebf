//! Datagram-socket transport layer (§4.5): UDP send/receive. Unlike the stream transport,
//! writes are whole `(bytes, address)` datagrams — never partially sent and never
//! coalesced — and a failed send surfaces through `error_received` rather than tearing the
//! transport down, since one bad destination shouldn't kill a socket serving many peers.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::Bytes;
use tokio::io::unix::AsyncFd;
use tokio::sync::Notify;

use crate::config::Config;
use crate::extra_info::{self, ExtraInfo};
use crate::protocol::{AbstractProtocol, AbstractTransport};

use super::erase_protocol;

struct Inner {
    write_buffer: VecDeque<(Bytes, SocketAddr)>,
    closing: bool,
    aborted: bool,
    connection_lost_called: bool,
}

pub struct DatagramTransport {
    fd: AsyncFd<std::net::UdpSocket>,
    protocol: Rc<RefCell<dyn AbstractProtocol>>,
    inner: RefCell<Inner>,
    extra: ExtraInfo,
    recv_size: usize,
    wake: Notify,
}

impl DatagramTransport {
    pub fn spawn<P: AbstractProtocol + 'static>(
        socket: std::net::UdpSocket,
        protocol: Rc<RefCell<P>>,
        config: Config,
    ) -> io::Result<Rc<DatagramTransport>> {
        socket.set_nonblocking(true)?;

        let mut extra = ExtraInfo::new();
        if let Ok(addr) = socket.local_addr() {
            extra.set(extra_info::EXTRA_INFO_NAME_SOCKET_NAME, addr);
        }
        if let Ok(addr) = socket.peer_addr() {
            extra.set(extra_info::EXTRA_INFO_NAME_PEER_NAME, addr);
        }

        let fd = AsyncFd::new(socket)?;
        let transport = Rc::new(DatagramTransport {
            fd,
            protocol: erase_protocol(protocol),
            inner: RefCell::new(Inner {
                write_buffer: VecDeque::new(),
                closing: false,
                aborted: false,
                connection_lost_called: false,
            }),
            extra,
            recv_size: config.recv_size_socket,
            wake: Notify::new(),
        });

        let driven = transport.clone();
        tokio::task::spawn_local(async move {
            let handle: Rc<dyn AbstractTransport> = driven.clone();
            driven.protocol.borrow_mut().connection_made(handle);
            driven.run().await;
        });

        Ok(transport)
    }

    /// Queues a datagram addressed to `address`. Datagrams are atomic: this either sends
    /// the whole thing or buffers the whole thing, never a prefix.
    pub fn send_to(&self, data: Bytes, address: SocketAddr) {
        if data.is_empty() {
            return;
        }
        let mut inner = self.inner.borrow_mut();
        if inner.aborted || inner.closing {
            return;
        }
        if !inner.write_buffer.is_empty() {
            inner.write_buffer.push_back((data, address));
            drop(inner);
            self.wake.notify_one();
            return;
        }
        drop(inner);

        match self.fd.get_ref().send_to(&data, address) {
            Ok(_) => {}
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                self.inner.borrow_mut().write_buffer.push_back((data, address));
                self.wake.notify_one();
            }
            Err(error) => self.protocol.borrow_mut().error_received(error),
        }
    }

    async fn run(self: Rc<Self>) {
        let mut recv_buf = vec![0u8; self.recv_size];

        loop {
            let (want_write, should_stop) = {
                let inner = self.inner.borrow();
                (
                    !inner.write_buffer.is_empty(),
                    inner.aborted || (inner.closing && inner.write_buffer.is_empty()),
                )
            };
            if should_stop {
                break;
            }

            tokio::select! {
                result = self.fd.readable() => {
                    match result {
                        Ok(mut guard) => match guard.try_io(|fd| fd.get_ref().recv_from(&mut recv_buf)) {
                            Ok(Ok((n, address))) => {
                                self.protocol
                                    .borrow_mut()
                                    .datagram_received(Bytes::copy_from_slice(&recv_buf[..n]), address);
                            }
                            Ok(Err(error)) => self.protocol.borrow_mut().error_received(error),
                            Err(_would_block) => {}
                        },
                        Err(error) => self.finish(Some(error.into())),
                    }
                }
                result = self.fd.writable(), if want_write => {
                    match result {
                        Ok(mut guard) => {
                            let sent = guard.try_io(|fd| {
                                let (data, address) = self.inner.borrow().write_buffer.front().cloned().unwrap();
                                fd.get_ref().send_to(&data, address)
                            });
                            match sent {
                                Ok(Ok(_)) => {
                                    self.inner.borrow_mut().write_buffer.pop_front();
                                }
                                Ok(Err(error)) => {
                                    self.inner.borrow_mut().write_buffer.pop_front();
                                    self.protocol.borrow_mut().error_received(error);
                                }
                                Err(_would_block) => {}
                            }
                        }
                        Err(error) => self.finish(Some(error.into())),
                    }
                }
                _ = self.wake.notified() => {}
            }
        }

        self.finish(None);
    }

    fn finish(&self, error: Option<anyhow::Error>) {
        let mut inner = self.inner.borrow_mut();
        if inner.connection_lost_called {
            return;
        }
        inner.connection_lost_called = true;
        inner.aborted = true;
        drop(inner);
        self.protocol.borrow_mut().connection_lost(error);
    }
}

impl AbstractTransport for DatagramTransport {
    fn get_extra_info(&self) -> &ExtraInfo {
        &self.extra
    }

    fn is_closing(&self) -> bool {
        let inner = self.inner.borrow();
        inner.closing || inner.aborted
    }

    fn close(&self) {
        self.inner.borrow_mut().closing = true;
        self.wake.notify_one();
    }

    fn abort(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.aborted = true;
        inner.write_buffer.clear();
        drop(inner);
        self.wake.notify_one();
    }

    fn get_write_buffer_size(&self) -> usize {
        self.inner.borrow().write_buffer.iter().map(|(data, _)| data.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;

    #[derive(Default)]
    struct RecordingProtocol {
        datagrams: Vec<(Vec<u8>, SocketAddr)>,
    }

    impl AbstractProtocol for RecordingProtocol {
        fn datagram_received(&mut self, data: Bytes, address: SocketAddr) {
            self.datagrams.push((data.to_vec(), address));
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn receives_addressed_datagrams() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let server = UdpSocket::bind("127.0.0.1:0").unwrap();
                let server_addr = server.local_addr().unwrap();
                let client = UdpSocket::bind("127.0.0.1:0").unwrap();
                let client_addr = client.local_addr().unwrap();

                let protocol = Rc::new(RefCell::new(RecordingProtocol::default()));
                let _transport = DatagramTransport::spawn(server, protocol.clone(), Config::default()).unwrap();

                client.send_to(b"ping", server_addr).unwrap();
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;

                let received = protocol.borrow();
                assert_eq!(received.datagrams.len(), 1);
                assert_eq!(received.datagrams[0].0, b"ping");
                assert_eq!(received.datagrams[0].1, client_addr);
            })
            .await;
    }
}

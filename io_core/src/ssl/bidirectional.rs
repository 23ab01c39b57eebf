//! Bidirectional SSL transport (§4.8): drives a `SslPipe` over a raw stream socket,
//! presenting the plaintext side to a protocol exactly like `StreamTransport` does.
//!
//! Writes accepted before the handshake completes cannot be handed to rustls's plaintext
//! writer and encrypted out of order, so they go through a backlog queue instead of the
//! fd directly. Two sentinel variants ride in that same queue alongside plain data so
//! `close()`/`write_eof()` requests made mid-handshake are applied in the order they were
//! issued rather than racing a direct path: `Eof` sends `close_notify` and keeps reading
//! (half-close), `Close` sends `close_notify` and tears the whole connection down once
//! the backlog in front of it has flushed.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::rc::Rc;
use std::sync::Arc;

use bytes::Bytes;
use once_cell::unsync::OnceCell;
use tokio::io::unix::AsyncFd;
use tokio::sync::Notify;

use crate::config::Config;
use crate::extra_info::ExtraInfo;
use crate::protocol::{AbstractProtocol, AbstractTransport};
use crate::transport::erase_protocol;

use super::pipe::SslPipe;

enum BacklogItem {
    Data(Bytes),
    Eof,
    Close,
}

struct Inner {
    backlog: VecDeque<BacklogItem>,
    outgoing_ciphertext: Vec<u8>,
    outgoing_offset: usize,
    closing: bool,
    aborted: bool,
    connection_lost_called: bool,
    handshake_done: bool,
}

impl Inner {
    fn has_outgoing(&self) -> bool {
        self.outgoing_offset < self.outgoing_ciphertext.len()
    }
}

pub struct SslBidirectionalTransport {
    fd: AsyncFd<std::net::TcpStream>,
    pipe: RefCell<SslPipe>,
    protocol: Rc<RefCell<dyn AbstractProtocol>>,
    inner: RefCell<Inner>,
    extra: OnceCell<ExtraInfo>,
    recv_size: usize,
    wake: Notify,
}

impl SslBidirectionalTransport {
    pub fn spawn_client<P: AbstractProtocol + 'static>(
        stream: std::net::TcpStream,
        config_tls: Arc<rustls::ClientConfig>,
        server_name: rustls::ServerName,
        protocol: Rc<RefCell<P>>,
        config: Config,
    ) -> io::Result<Rc<SslBidirectionalTransport>> {
        let pipe = SslPipe::client(config_tls, server_name).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Self::spawn(stream, pipe, protocol, config)
    }

    pub fn spawn_server<P: AbstractProtocol + 'static>(
        stream: std::net::TcpStream,
        config_tls: Arc<rustls::ServerConfig>,
        protocol: Rc<RefCell<P>>,
        config: Config,
    ) -> io::Result<Rc<SslBidirectionalTransport>> {
        let pipe = SslPipe::server(config_tls).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Self::spawn(stream, pipe, protocol, config)
    }

    fn spawn<P: AbstractProtocol + 'static>(
        stream: std::net::TcpStream,
        pipe: SslPipe,
        protocol: Rc<RefCell<P>>,
        config: Config,
    ) -> io::Result<Rc<SslBidirectionalTransport>> {
        stream.set_nonblocking(true)?;
        let fd = AsyncFd::new(stream)?;

        let transport = Rc::new(SslBidirectionalTransport {
            fd,
            pipe: RefCell::new(pipe),
            protocol: erase_protocol(protocol),
            inner: RefCell::new(Inner {
                backlog: VecDeque::new(),
                outgoing_ciphertext: Vec::new(),
                outgoing_offset: 0,
                closing: false,
                aborted: false,
                connection_lost_called: false,
                handshake_done: false,
            }),
            extra: OnceCell::new(),
            recv_size: config.recv_size_socket,
            wake: Notify::new(),
        });

        // `connection_made` fires once the TLS handshake completes, not at construction:
        // a protocol shouldn't see the transport before there's a session to speak over.
        let driven = transport.clone();
        tokio::task::spawn_local(async move {
            driven.refill_outgoing_ciphertext();
            driven.run().await;
        });

        Ok(transport)
    }

    async fn run(self: Rc<Self>) {
        let mut recv_buf = vec![0u8; self.recv_size];
        loop {
            self.pump_backlog_into_pipe();
            self.refill_outgoing_ciphertext();

            let (want_write, should_stop) = {
                let inner = self.inner.borrow();
                (
                    inner.has_outgoing(),
                    inner.aborted || (inner.closing && !inner.has_outgoing() && inner.backlog.is_empty()),
                )
            };
            if should_stop {
                break;
            }

            tokio::select! {
                result = self.fd.readable() => {
                    match result {
                        Ok(mut guard) => match guard.try_io(|fd| fd.get_ref().read(&mut recv_buf)) {
                            Ok(Ok(0)) => {
                                self.finish(Some(io::Error::from(io::ErrorKind::UnexpectedEof).into()));
                                return;
                            }
                            Ok(Ok(n)) => {
                                if let Err(error) = self.on_ciphertext(&recv_buf[..n]) {
                                    self.finish(Some(error.into()));
                                    return;
                                }
                            }
                            Ok(Err(error)) => { self.finish(Some(error.into())); return; }
                            Err(_would_block) => {}
                        },
                        Err(error) => { self.finish(Some(error.into())); return; }
                    }
                }
                result = self.fd.writable(), if want_write => {
                    match result {
                        Ok(mut guard) => match guard.try_io(|fd| self.flush_ciphertext(fd.get_ref())) {
                            Ok(Ok(())) => {}
                            Ok(Err(error)) => { self.finish(Some(error.into())); return; }
                            Err(_would_block) => {}
                        },
                        Err(error) => { self.finish(Some(error.into())); return; }
                    }
                }
                _ = self.wake.notified() => {}
            }
        }
        self.finish(None);
    }

    fn on_ciphertext(self: &Rc<Self>, data: &[u8]) -> Result<(), crate::error::TlsError> {
        let was_handshaking = self.pipe.borrow().is_handshaking();
        self.pipe.borrow_mut().feed_ciphertext(data)?;
        self.refill_outgoing_ciphertext();

        let now_handshaking = self.pipe.borrow().is_handshaking();
        if was_handshaking && !now_handshaking && !self.inner.borrow().handshake_done {
            self.on_handshake_complete();
        }
        if !now_handshaking {
            self.drain_plaintext();
        }
        Ok(())
    }

    fn on_handshake_complete(self: &Rc<Self>) {
        self.inner.borrow_mut().handshake_done = true;

        let mut extra = ExtraInfo::new();
        if let Ok(addr) = self.fd.get_ref().peer_addr() {
            extra.set(crate::extra_info::EXTRA_INFO_NAME_PEER_NAME, addr);
        }
        let _ = self.extra.set(extra);

        let handle: Rc<dyn AbstractTransport> = self.clone();
        self.protocol.borrow_mut().connection_made(handle);

        self.pump_backlog_into_pipe();
        self.refill_outgoing_ciphertext();
    }

    fn drain_plaintext(&self) {
        let mut buf = vec![0u8; self.recv_size];
        loop {
            let result = self.pipe.borrow_mut().read_plaintext(&mut buf);
            match result {
                Ok(0) => {
                    let keep_open = self.protocol.borrow_mut().eof_received();
                    if !keep_open {
                        self.inner.borrow_mut().aborted = true;
                    }
                    break;
                }
                Ok(n) => self.protocol.borrow_mut().data_received(Bytes::copy_from_slice(&buf[..n])),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
    }

    /// rustls buffers plaintext writes internally even mid-handshake and emits the
    /// resulting ciphertext once the session is established, so draining the backlog
    /// early is safe; only the delivery *order* (data before/after a sentinel) matters.
    fn pump_backlog_into_pipe(&self) {
        loop {
            let item = self.inner.borrow_mut().backlog.pop_front();
            let Some(item) = item else { return };
            match item {
                BacklogItem::Data(data) => {
                    let _ = self.pipe.borrow_mut().write_plaintext(&data);
                }
                BacklogItem::Eof => {
                    self.pipe.borrow_mut().send_close_notify();
                }
                BacklogItem::Close => {
                    self.pipe.borrow_mut().send_close_notify();
                    self.inner.borrow_mut().closing = true;
                }
            }
        }
    }

    fn refill_outgoing_ciphertext(&self) {
        let chunk = self.pipe.borrow_mut().take_outgoing_ciphertext();
        if !chunk.is_empty() {
            self.inner.borrow_mut().outgoing_ciphertext.extend_from_slice(&chunk);
            self.wake.notify_one();
        }
    }

    fn flush_ciphertext(&self, mut sock: &std::net::TcpStream) -> io::Result<()> {
        loop {
            let slice_to_write = {
                let inner = self.inner.borrow();
                if !inner.has_outgoing() {
                    return Ok(());
                }
                inner.outgoing_ciphertext[inner.outgoing_offset..].to_vec()
            };
            let written = sock.write(&slice_to_write)?;
            let mut inner = self.inner.borrow_mut();
            inner.outgoing_offset += written;
            if !inner.has_outgoing() {
                inner.outgoing_ciphertext.clear();
                inner.outgoing_offset = 0;
                return Ok(());
            }
        }
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

impl AbstractTransport for SslBidirectionalTransport {
    fn get_extra_info(&self) -> &ExtraInfo {
        self.extra.get_or_init(ExtraInfo::new)
    }

    fn is_closing(&self) -> bool {
        let inner = self.inner.borrow();
        inner.closing || inner.aborted
    }

    fn close(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.aborted {
            return;
        }
        inner.backlog.push_back(BacklogItem::Close);
        drop(inner);
        self.wake.notify_one();
    }

    fn abort(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.aborted = true;
        inner.backlog.clear();
        inner.outgoing_ciphertext.clear();
        inner.outgoing_offset = 0;
        drop(inner);
        self.wake.notify_one();
    }

    fn write(&self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let mut inner = self.inner.borrow_mut();
        if inner.aborted || inner.closing {
            return;
        }
        inner.backlog.push_back(BacklogItem::Data(data));
        drop(inner);
        self.wake.notify_one();
    }

    fn write_eof(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.aborted {
            return;
        }
        inner.backlog.push_back(BacklogItem::Eof);
        drop(inner);
        self.wake.notify_one();
    }

    fn can_write_eof(&self) -> bool {
        true
    }

    fn get_write_buffer_size(&self) -> usize {
        self.inner
            .borrow()
            .backlog
            .iter()
            .filter_map(|item| match item {
                BacklogItem::Data(data) => Some(data.len()),
                _ => None,
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    #[derive(Default)]
    struct RecordingProtocol {
        received: Vec<u8>,
        made: bool,
        eof: bool,
        lost: bool,
    }

    impl AbstractProtocol for RecordingProtocol {
        fn connection_made(&mut self, _transport: Rc<dyn AbstractTransport>) {
            self.made = true;
        }
        fn data_received(&mut self, data: Bytes) {
            self.received.extend_from_slice(&data);
        }
        fn eof_received(&mut self) -> bool {
            self.eof = true;
            false
        }
        fn connection_lost(&mut self, _exception: Option<anyhow::Error>) {
            self.lost = true;
        }
    }

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn configs() -> (Arc<rustls::ClientConfig>, Arc<rustls::ServerConfig>, rustls::ServerName) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_der = rustls::Certificate(cert.serialize_der().unwrap());
        let key_der = rustls::PrivateKey(cert.serialize_private_key_der());

        let mut roots = rustls::RootCertStore::empty();
        roots.add(&cert_der).unwrap();

        let client_config =
            rustls::ClientConfig::builder().with_safe_defaults().with_root_certificates(roots).with_no_client_auth();
        let server_config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .unwrap();

        (Arc::new(client_config), Arc::new(server_config), rustls::ServerName::try_from("localhost").unwrap())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn handshake_then_plaintext_round_trip_over_a_real_socket() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (client_sock, server_sock) = connected_pair();
                let (client_cfg, server_cfg, name) = configs();

                let client_protocol = Rc::new(RefCell::new(RecordingProtocol::default()));
                let server_protocol = Rc::new(RefCell::new(RecordingProtocol::default()));

                let client_transport = SslBidirectionalTransport::spawn_client(
                    client_sock,
                    client_cfg,
                    name,
                    client_protocol.clone(),
                    Config::default(),
                )
                .unwrap();
                let _server_transport =
                    SslBidirectionalTransport::spawn_server(server_sock, server_cfg, server_protocol.clone(), Config::default())
                        .unwrap();

                // Let the handshake run; connection_made only fires once it completes.
                for _ in 0..50 {
                    tokio::task::yield_now().await;
                }
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                assert!(client_protocol.borrow().made);
                assert!(server_protocol.borrow().made);

                client_transport.write(Bytes::from_static(b"hello over tls"));
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                assert_eq!(server_protocol.borrow().received, b"hello over tls");

                client_transport.close();
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                assert!(client_protocol.borrow().lost);
            })
            .await;
    }
}

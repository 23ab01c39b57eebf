//! SSL pipe (§4.7): pure state-machine wrapper around a `rustls` connection, with no fd of
//! its own. Ciphertext goes in, plaintext comes out, and vice versa; the bidirectional
//! transport is the only thing that ever touches a socket.
//!
//! `rustls::ConnectionCommon`'s `read_tls`/`process_new_packets`/`reader().read`/
//! `writer().write`/`write_tls` staging buffers stand in for the explicit pair of memory
//! BIOs an OpenSSL-style pipe would use: `read_tls` is "feed ciphertext in",
//! `write_tls` is "drain ciphertext out", and `reader()`/`writer()` are the plaintext
//! sides. `io::ErrorKind::WouldBlock` plays the role `SSL_ERROR_WANT_READ`/
//! `SSL_ERROR_WANT_WRITE` would in an explicit-BIO design.

use std::io::{self, Read, Write};
use std::sync::Arc;

use crate::error::TlsError;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SslRole {
    Client,
    Server,
}

pub struct SslPipe {
    conn: Box<dyn rustls::Connection>,
    role: SslRole,
}

impl SslPipe {
    pub fn client(config: Arc<rustls::ClientConfig>, server_name: rustls::ServerName) -> Result<Self, TlsError> {
        let conn = rustls::ClientConnection::new(config, server_name).map_err(TlsError::Handshake)?;
        Ok(Self { conn: Box::new(conn), role: SslRole::Client })
    }

    pub fn server(config: Arc<rustls::ServerConfig>) -> Result<Self, TlsError> {
        let conn = rustls::ServerConnection::new(config).map_err(TlsError::Handshake)?;
        Ok(Self { conn: Box::new(conn), role: SslRole::Server })
    }

    pub fn role(&self) -> SslRole {
        self.role
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    pub fn wants_read(&self) -> bool {
        self.conn.wants_read()
    }

    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    /// Feeds raw ciphertext received off the wire in, then lets rustls process as many
    /// complete TLS records as `data` contains. Returns the number of bytes consumed
    /// (always `data.len()` for an in-memory slice; kept `usize` to mirror the streaming
    /// read-side contract).
    pub fn feed_ciphertext(&mut self, data: &[u8]) -> Result<usize, TlsError> {
        let mut cursor = io::Cursor::new(data);
        let n = self.conn.read_tls(&mut cursor).map_err(TlsError::Io)?;
        self.process_new_packets()?;
        Ok(n)
    }

    fn process_new_packets(&mut self) -> Result<(), TlsError> {
        match self.conn.process_new_packets() {
            Ok(_) => Ok(()),
            Err(error) if self.conn.is_handshaking() => Err(TlsError::Handshake(error)),
            Err(error) => Err(TlsError::PostHandshake(error)),
        }
    }

    /// Drains whatever outgoing ciphertext the handshake, a prior `write_plaintext`, or a
    /// close-notify alert has queued up.
    pub fn take_outgoing_ciphertext(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut out) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        out
    }

    /// Reads decrypted application data. `Err(WouldBlock)` means the handshake isn't
    /// finished yet or no complete record has arrived; `Ok(0)` means a clean TLS shutdown
    /// (peer sent `close_notify`).
    pub fn read_plaintext(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.conn.reader().read(buf)
    }

    /// Queues plaintext application data for encryption; call `take_outgoing_ciphertext`
    /// afterwards to get the resulting records.
    pub fn write_plaintext(&mut self, data: &[u8]) -> io::Result<usize> {
        self.conn.writer().write(data)
    }

    pub fn send_close_notify(&mut self) {
        self.conn.send_close_notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configs() -> (Arc<rustls::ClientConfig>, Arc<rustls::ServerConfig>, rustls::ServerName) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_der = rustls::Certificate(cert.serialize_der().unwrap());
        let key_der = rustls::PrivateKey(cert.serialize_private_key_der());

        let mut roots = rustls::RootCertStore::empty();
        roots.add(&cert_der).unwrap();

        let client_config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let server_config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .unwrap();

        let name = rustls::ServerName::try_from("localhost").unwrap();
        (Arc::new(client_config), Arc::new(server_config), name)
    }

    fn pump(a: &mut SslPipe, b: &mut SslPipe) {
        for _ in 0..20 {
            let out_a = a.take_outgoing_ciphertext();
            if !out_a.is_empty() {
                b.feed_ciphertext(&out_a).unwrap();
            }
            let out_b = b.take_outgoing_ciphertext();
            if !out_b.is_empty() {
                a.feed_ciphertext(&out_b).unwrap();
            }
            if out_a.is_empty() && out_b.is_empty() {
                break;
            }
        }
    }

    #[test]
    fn handshake_completes_and_plaintext_round_trips() {
        let (client_cfg, server_cfg, name) = configs();
        let mut client = SslPipe::client(client_cfg, name).unwrap();
        let mut server = SslPipe::server(server_cfg).unwrap();

        pump(&mut client, &mut server);
        assert!(!client.is_handshaking());
        assert!(!server.is_handshaking());

        client.write_plaintext(b"hello from client").unwrap();
        pump(&mut client, &mut server);

        let mut buf = [0u8; 64];
        let n = server.read_plaintext(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello from client");
    }

    #[test]
    fn close_notify_yields_clean_eof() {
        let (client_cfg, server_cfg, name) = configs();
        let mut client = SslPipe::client(client_cfg, name).unwrap();
        let mut server = SslPipe::server(server_cfg).unwrap();
        pump(&mut client, &mut server);

        client.send_close_notify();
        pump(&mut client, &mut server);

        let mut buf = [0u8; 16];
        let n = server.read_plaintext(&mut buf).unwrap();
        assert_eq!(n, 0);
    }
}

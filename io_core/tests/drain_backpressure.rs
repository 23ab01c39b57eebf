//! End-to-end coverage of §8 scenario 4 ("drain back-pressure"): with small water marks,
//! writing more than the high-water mark to a transport whose peer isn't reading yet
//! should pause the writer exactly once, and resuming once the peer drains its socket
//! buffer should let a pending `drain()` complete.

use std::cell::RefCell;
use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::rc::Rc;

use bytes::Bytes;

use io_core::protocol::{AbstractProtocol, AbstractTransport, ReadProtocol, ReadWriteProtocol};
use io_core::transport::stream::StreamTransport;
use io_core::{Config, NoopFlowControl};

/// Concrete protocol embedding `ReadWriteProtocol`, forwarding the callbacks a transport
/// drives and the pause/resume notifications into the drain waiter.
struct EchoProtocol {
    rw: ReadWriteProtocol<NoopFlowControl, StreamTransport>,
}

impl EchoProtocol {
    fn new() -> Self {
        Self { rw: ReadWriteProtocol::new(ReadProtocol::new(NoopFlowControl::default(), 131072)) }
    }
}

impl AbstractProtocol for EchoProtocol {
    fn data_received(&mut self, data: Bytes) {
        self.rw.read.data_received(data);
    }

    fn pause_writing(&mut self) {
        self.rw.pause_writing();
    }

    fn resume_writing(&mut self) {
        self.rw.resume_writing();
    }

    fn connection_lost(&mut self, exception: Option<anyhow::Error>) {
        self.rw.note_connection_lost(exception);
    }
}

fn connected_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

#[tokio::test(flavor = "current_thread")]
async fn pause_then_resume_unblocks_a_pending_drain() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let (mut peer, server) = connected_pair();
            peer.set_nonblocking(true).unwrap();

            let protocol = Rc::new(RefCell::new(EchoProtocol::new()));
            let low_water = 16;
            let high_water = 64;
            let config = Config { low_water, high_water, ..Config::default() };
            let transport = StreamTransport::spawn(server, protocol.clone(), config).unwrap();
            protocol.borrow_mut().rw.attach_transport(transport.clone());
            transport.set_write_buffer_limits(Some(low_water), Some(high_water));

            // A single write this large can never complete atomically against a socket
            // whose peer isn't reading: the kernel send/receive buffers cap out well below
            // this, well before anything close to the high-water mark, so the remainder is
            // guaranteed to land in the transport's own write buffer.
            let payload_len = 8 * 1024 * 1024;
            protocol.borrow_mut().rw.write(Bytes::from(vec![b'x'; payload_len]));
            tokio::task::yield_now().await;
            assert!(transport.get_write_buffer_size() > high_water);

            let drain = protocol.borrow().rw.drain();
            tokio::pin!(drain);
            assert!(futures_util::poll!(&mut drain).is_pending());

            // Drain the peer's socket buffer in chunks, yielding back to the runtime
            // between reads so the driver task can flush newly freed space, until the
            // transport's buffered amount falls back to the low-water mark.
            let mut buf = vec![0u8; 256 * 1024];
            while transport.get_write_buffer_size() > low_water {
                match peer.read(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) => panic!("unexpected read error: {e}"),
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }

            tokio::time::timeout(std::time::Duration::from_secs(5), drain).await.unwrap().unwrap();
        })
        .await;
}

//! Duplex framed message channels over stream sockets.
//!
//! A [`Channel`] binds one connected TCP socket and moves whole
//! [`Envelope`] payloads across it, framed as an 8-byte little-endian
//! length prefix followed by the payload bytes. Each operation exists
//! in a synchronous flavour that blocks the caller and an asynchronous
//! flavour whose completion callback fires on the reactor worker.
//!
//! Outbound channels own their reactor and its worker thread; channels
//! wrapped around accepted connections share the adapter's reactor.

use std::io;
use std::marker::PhantomData;
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, error, trace, warn};
use socket2::SockRef;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;
use crate::endpoint;
use crate::envelope::Envelope;
use crate::error::{Error, ErrorKind, Result};
use crate::reactor::{spawn_worker, Reactor, WorkAnchor};

/// Width of the length prefix on the wire, in bytes.
///
/// The prefix is a little-endian `u64` regardless of host word size, so
/// heterogeneous hosts agree on frame boundaries.
pub const LENGTH_PREFIX_SIZE: usize = 8;

/// A duplex framed message pipe bound to one connected stream socket.
///
/// Sync operations must not be called from a completion callback: they
/// block the caller until the reactor worker finishes the operation,
/// and the callback already runs on that worker.
pub struct Channel<M: Envelope> {
    shared: Arc<Shared>,
    _marker: PhantomData<fn(M) -> M>,
}

struct Shared {
    config: Config,
    ready: AtomicBool,
    conn: Mutex<Option<Conn>>,
    recv_busy: AtomicBool,
}

/// Per-connection state. Replaced wholesale on re-establish.
struct Conn {
    sock: Arc<TcpStream>,
    writer: mpsc::UnboundedSender<SendJob>,
    reactor: Arc<Reactor>,
    /// Present only when this channel owns the reactor (outbound).
    worker: Option<thread::JoinHandle<()>>,
    _anchor: WorkAnchor,
}

/// Token representing the single permitted in-flight receive.
struct RecvToken {
    shared: Arc<Shared>,
}

impl Drop for RecvToken {
    fn drop(&mut self) {
        self.shared.recv_busy.store(false, Ordering::Release);
    }
}

enum SendCompletion {
    Callback(Box<dyn FnOnce(Result<usize>) + Send>),
    Blocking(oneshot::Sender<Result<usize>>),
}

struct SendJob {
    frame: Vec<u8>,
    completion: SendCompletion,
    _anchor: WorkAnchor,
}

impl<M: Envelope> Channel<M> {
    /// Creates an unbound channel, ready to [`establish`](Channel::establish).
    pub fn new() -> Channel<M> {
        Self::with_config(Config::default())
    }

    /// Creates an unbound channel with explicit configuration.
    pub fn with_config(config: Config) -> Channel<M> {
        Channel {
            shared: Arc::new(Shared {
                config,
                ready: AtomicBool::new(false),
                conn: Mutex::new(None),
                recv_busy: AtomicBool::new(false),
            }),
            _marker: PhantomData,
        }
    }

    /// Wraps a socket produced by the adapter's acceptor.
    ///
    /// Must be called from within the reactor's runtime context; the
    /// accept loop satisfies this. The channel is immediately ready.
    pub(crate) fn from_accepted(
        stream: TcpStream,
        reactor: Arc<Reactor>,
        config: Config,
    ) -> Channel<M> {
        if config.nodelay {
            if let Err(err) = stream.set_nodelay(true) {
                debug!("TCP_NODELAY not applied to accepted socket: {err}");
            }
        }
        let sock = Arc::new(stream);
        let anchor = reactor.anchor();
        let (writer, jobs) = mpsc::unbounded_channel();
        reactor.spawn(run_writer(Arc::clone(&sock), jobs));
        debug!("creating new channel around accepted socket");
        Channel {
            shared: Arc::new(Shared {
                config,
                ready: AtomicBool::new(true),
                conn: Mutex::new(Some(Conn {
                    sock,
                    writer,
                    reactor,
                    worker: None,
                    _anchor: anchor,
                })),
                recv_busy: AtomicBool::new(false),
            }),
            _marker: PhantomData,
        }
    }

    /// Connects this channel to a remote endpoint.
    ///
    /// If the channel already has an open socket, the previous
    /// connection is terminated first. Resolution candidates are tried
    /// in order; the first successful connection wins. On success the
    /// channel owns a fresh reactor, spawns its worker and becomes
    /// ready.
    pub fn establish(&self, endpoint_uri: &str) -> Result<()> {
        if self.shared.conn.lock().unwrap().is_some() {
            warn!(
                "establishing a new connection on an already-connected channel; \
                 the previous connection will be terminated"
            );
            self.close();
        }

        debug!("establishing a new channel, remote endpoint is {endpoint_uri}");
        let endpoint = endpoint::parse(endpoint_uri)?;
        let candidates = endpoint.resolve()?;

        let mut last_err: Option<io::Error> = None;
        let mut connected = None;
        for addr in candidates {
            match std::net::TcpStream::connect(addr) {
                Ok(stream) => {
                    connected = Some(stream);
                    break;
                }
                Err(err) => {
                    debug!("candidate {addr} refused: {err}");
                    last_err = Some(err);
                }
            }
        }
        let stream = match connected {
            Some(stream) => stream,
            None => {
                let err = match last_err {
                    Some(cause) => Error::with_io(ErrorKind::Connect, cause),
                    None => Error::new(ErrorKind::Connect),
                };
                error!("failed to establish a channel to remote endpoint {endpoint_uri}: {err}");
                return Err(err);
            }
        };
        stream.set_nonblocking(true)?;

        let reactor = Arc::new(Reactor::new()?);
        let anchor = reactor.anchor();
        let sock = {
            let _guard = reactor.handle().enter();
            Arc::new(TcpStream::from_std(stream)?)
        };
        if self.shared.config.nodelay {
            if let Err(err) = sock.set_nodelay(true) {
                debug!("TCP_NODELAY not applied: {err}");
            }
        }

        let (writer, jobs) = mpsc::unbounded_channel();
        reactor.spawn(run_writer(Arc::clone(&sock), jobs));
        let worker = spawn_worker(Arc::clone(&reactor))?;

        *self.shared.conn.lock().unwrap() = Some(Conn {
            sock,
            writer,
            reactor,
            worker: Some(worker),
            _anchor: anchor,
        });
        self.shared.ready.store(true, Ordering::Release);
        trace!("channel connected and ready");
        Ok(())
    }

    /// True iff the channel's socket is open and usable.
    pub fn ready(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire) && self.shared.conn.lock().unwrap().is_some()
    }

    /// Sends one message, blocking until the whole frame has been
    /// handed to the kernel.
    ///
    /// The frame is the 8-byte length prefix followed by exactly
    /// `message.size()` payload bytes. A short write is an error; there
    /// is no retry.
    pub fn send_sync(&self, message: &M) -> Result<()> {
        let frame = encode_frame(message, self.shared.config.max_frame_size)?;
        trace!(
            "trying to send message of size {}",
            frame.len() - LENGTH_PREFIX_SIZE
        );
        let (tx, rx) = oneshot::channel();
        self.enqueue_send(frame, SendCompletion::Blocking(tx))?;
        match rx.blocking_recv() {
            Ok(result) => result.map(|_| ()),
            // The writer went away mid-operation; the channel was closed.
            Err(_) => Err(Error::new(ErrorKind::NotReady)),
        }
    }

    /// Sends one message without blocking past the enqueue.
    ///
    /// The callback fires on the reactor worker with the total number
    /// of bytes put on the wire (`LENGTH_PREFIX_SIZE + payload`), or
    /// the error that stopped the write. Frames enqueued back-to-back
    /// reach the wire contiguously and in order.
    pub fn send_async<F>(&self, message: &M, callback: F) -> Result<()>
    where
        F: FnOnce(Result<usize>) + Send + 'static,
    {
        let frame = encode_frame(message, self.shared.config.max_frame_size)?;
        trace!(
            "trying to asynchronously send message of size {}",
            frame.len() - LENGTH_PREFIX_SIZE
        );
        self.enqueue_send(frame, SendCompletion::Callback(Box::new(callback)))
    }

    /// Receives one message, blocking until a whole frame has arrived
    /// and parsed into `message`.
    pub fn recv_sync(&self, message: &mut M) -> Result<()> {
        trace!("polling for next message");
        let (shared, sock) = match self.recv_handles() {
            Ok(handles) => handles,
            Err(err) => {
                warn!("tried to read from a channel which is not ready; read failed");
                return Err(err);
            }
        };
        let token = shared.acquire_recv_token()?;
        let (reactor, anchor) = self.reactor_anchor()?;

        let (tx, rx) = oneshot::channel();
        reactor.spawn(async move {
            let _anchor = anchor;
            let result = run_recv(shared, sock, token).await;
            let _ = tx.send(result);
        });
        let payload = rx
            .blocking_recv()
            .map_err(|_| Error::new(ErrorKind::NotReady))??;
        if !message.parse(&payload) {
            return Err(Error::new(ErrorKind::Parse));
        }
        trace!("read {} bytes of payload data", payload.len());
        Ok(())
    }

    /// Queues an asynchronous receive of one message.
    ///
    /// Fails immediately with [`ErrorKind::NotReady`] if the channel is
    /// not ready and with [`ErrorKind::Busy`] if a receive is already
    /// in flight. Otherwise the staged read proceeds on the reactor:
    /// prefix, then payload, then parse into `message`. The in-flight
    /// token is released strictly before the callback runs, so the
    /// callback may issue the next `recv_async` directly. Terminal
    /// failures are reported through the callback and close the
    /// channel.
    pub fn recv_async<F>(&self, mut message: M, callback: F) -> Result<()>
    where
        F: FnOnce(Result<usize>, M) + Send + 'static,
    {
        trace!("waiting for next message");
        let (shared, sock) = match self.recv_handles() {
            Ok(handles) => handles,
            Err(err) => {
                warn!("tried to read from a channel which is not ready; read failed");
                return Err(err);
            }
        };
        let token = shared.acquire_recv_token()?;
        let (reactor, anchor) = self.reactor_anchor()?;

        reactor.spawn(async move {
            let _anchor = anchor;
            let result = match run_recv(shared, sock, token).await {
                Ok(payload) => {
                    if message.parse(&payload) {
                        Ok(payload.len())
                    } else {
                        Err(Error::new(ErrorKind::Parse))
                    }
                }
                Err(err) => Err(err),
            };
            trace!("about to invoke final async recv callback");
            callback(result, message);
        });
        Ok(())
    }

    /// Shuts the socket down in both directions and clears readiness.
    ///
    /// A pending asynchronous receive is not cancelled; it completes
    /// with an error from the shut-down socket. Idempotent.
    pub fn close(&self) {
        if let Some(worker) = self.shared.teardown() {
            reap_worker(worker);
        }
    }

    fn enqueue_send(&self, frame: Vec<u8>, completion: SendCompletion) -> Result<()> {
        let guard = self.shared.conn.lock().unwrap();
        let conn = match guard.as_ref() {
            Some(conn) if self.shared.ready.load(Ordering::Acquire) => conn,
            _ => {
                debug!("tried to send on a channel which is not ready");
                return Err(Error::new(ErrorKind::NotReady));
            }
        };
        let job = SendJob {
            frame,
            completion,
            _anchor: conn.reactor.anchor(),
        };
        conn.writer
            .send(job)
            .map_err(|_| Error::new(ErrorKind::NotReady))
    }

    fn recv_handles(&self) -> Result<(Arc<Shared>, Arc<TcpStream>)> {
        let sock = self.shared.socket()?;
        Ok((Arc::clone(&self.shared), sock))
    }

    fn reactor_anchor(&self) -> Result<(Arc<Reactor>, WorkAnchor)> {
        let guard = self.shared.conn.lock().unwrap();
        let conn = guard
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::NotReady))?;
        Ok((Arc::clone(&conn.reactor), conn.reactor.anchor()))
    }

    /// Waits until the socket reports readable data.
    pub(crate) async fn wait_readable(&self) -> Result<()> {
        let sock = self.shared.socket()?;
        sock.readable().await?;
        Ok(())
    }

    /// Reads one frame off the wire, for in-reactor consumers.
    pub(crate) async fn recv_payload(&self) -> Result<Vec<u8>> {
        let sock = self.shared.socket()?;
        let token = self.shared.acquire_recv_token()?;
        run_recv(Arc::clone(&self.shared), sock, token).await
    }

    /// True while an asynchronous receive is in flight.
    pub(crate) fn recv_busy(&self) -> bool {
        self.shared.recv_busy.load(Ordering::Acquire)
    }
}

impl<M: Envelope> Default for Channel<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Envelope> Drop for Channel<M> {
    /// The user may already have cleaned up manually. If not, do so now.
    fn drop(&mut self) {
        if self.ready() {
            self.close();
        }
        trace!("channel destroyed");
    }
}

impl Shared {
    fn socket(&self) -> Result<Arc<TcpStream>> {
        let guard = self.conn.lock().unwrap();
        match guard.as_ref() {
            Some(conn) if self.ready.load(Ordering::Acquire) => Ok(Arc::clone(&conn.sock)),
            _ => Err(Error::new(ErrorKind::NotReady)),
        }
    }

    fn acquire_recv_token(self: &Arc<Self>) -> Result<RecvToken> {
        if self
            .recv_busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::new(ErrorKind::Busy));
        }
        Ok(RecvToken {
            shared: Arc::clone(self),
        })
    }

    /// Clears readiness, shuts the socket down and drops the
    /// connection state. Returns the worker handle of an owned reactor
    /// so the caller can join it once no locks are held.
    fn teardown(&self) -> Option<thread::JoinHandle<()>> {
        let mut conn = {
            let mut guard = self.conn.lock().unwrap();
            if guard.is_none() {
                return None;
            }
            // Readiness must drop before the socket is torn down.
            self.ready.store(false, Ordering::Release);
            guard.take()?
        };
        trace!("shutting down channel socket");
        if let Err(err) = SockRef::from(&*conn.sock).shutdown(Shutdown::Both) {
            debug!("socket shutdown reported: {err}");
        }
        conn.worker.take()
        // Dropping the rest of `conn` releases the writer queue and the
        // connection's work-anchor.
    }
}

/// Joins a finished reactor worker, unless the caller *is* that worker
/// (tearing down from a completion callback), in which case the thread
/// is left to exit on its own.
fn reap_worker(worker: thread::JoinHandle<()>) {
    if worker.thread().id() == thread::current().id() {
        return;
    }
    if worker.join().is_err() {
        debug!("reactor worker panicked during shutdown");
    }
}

fn encode_frame<M: Envelope>(message: &M, max_frame_size: usize) -> Result<Vec<u8>> {
    let size = message.size();
    if size > max_frame_size {
        return Err(Error::new(ErrorKind::Framing));
    }
    let mut frame = vec![0u8; LENGTH_PREFIX_SIZE + size];
    frame[..LENGTH_PREFIX_SIZE].copy_from_slice(&(size as u64).to_le_bytes());
    if !message.serialize(&mut frame[LENGTH_PREFIX_SIZE..]) {
        return Err(Error::new(ErrorKind::Serialize));
    }
    Ok(frame)
}

/// A receive failure after which the stream is dead or desynchronized.
/// Parse failures are excluded: the frame boundary was still intact.
fn terminal_recv_error(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::Eof | ErrorKind::Io | ErrorKind::Framing)
}

/// Reads one frame: prefix, validation, payload. Releases the receive
/// token before returning; terminal failures tear the connection down
/// so `ready()` observes the death.
async fn run_recv(shared: Arc<Shared>, sock: Arc<TcpStream>, token: RecvToken) -> Result<Vec<u8>> {
    let result = recv_frame(&shared, &sock).await;
    if let Err(ref err) = result {
        debug!("error reading from connection: {err}");
        if terminal_recv_error(err.kind()) {
            if let Some(worker) = shared.teardown() {
                reap_worker(worker);
            }
        }
    }
    drop(token);
    result
}

async fn recv_frame(shared: &Shared, sock: &TcpStream) -> Result<Vec<u8>> {
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    read_full(sock, &mut prefix).await?;
    let length = u64::from_le_bytes(prefix);
    if length == 0 || length > shared.config.max_frame_size as u64 {
        return Err(Error::new(ErrorKind::Framing));
    }
    trace!("size of incoming message is {length} bytes");
    let mut payload = vec![0u8; length as usize];
    read_full(sock, &mut payload).await?;
    Ok(payload)
}

async fn read_full(sock: &TcpStream, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        sock.readable().await?;
        match sock.try_read(&mut buf[filled..]) {
            Ok(0) => {
                debug!("received EOF, connection terminating");
                return Err(Error::new(ErrorKind::Eof));
            }
            Ok(n) => filled += n,
            Err(ref err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted =>
            {
                continue;
            }
            Err(err) => return Err(Error::from(err)),
        }
    }
    Ok(())
}

async fn write_full(sock: &TcpStream, buf: &[u8]) -> Result<()> {
    let mut written = 0;
    while written < buf.len() {
        sock.writable().await?;
        match sock.try_write(&buf[written..]) {
            Ok(0) => return Err(Error::new(ErrorKind::ShortIo)),
            Ok(n) => written += n,
            Err(ref err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted =>
            {
                continue;
            }
            Err(err) => return Err(Error::from(err)),
        }
    }
    Ok(())
}

/// Drains the per-connection send queue in FIFO order, which keeps
/// every frame contiguous on the wire. Ends when the channel drops its
/// sender; jobs already queued still complete (or fail) first.
async fn run_writer(sock: Arc<TcpStream>, mut jobs: mpsc::UnboundedReceiver<SendJob>) {
    while let Some(job) = jobs.recv().await {
        let total = job.frame.len();
        let result = write_full(&sock, &job.frame).await.map(|()| total);
        match &result {
            Ok(sent) => trace!("sent {sent} bytes on the wire"),
            Err(err) => debug!("error sending message on connection: {err}"),
        }
        match job.completion {
            SendCompletion::Callback(callback) => callback(result),
            SendCompletion::Blocking(tx) => {
                let _ = tx.send(result);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::BytesEnvelope;

    #[test]
    fn test_encode_frame_layout() {
        let message = BytesEnvelope::new(vec![0xAA; 5]);
        let frame = encode_frame(&message, 1024).unwrap();
        assert_eq!(frame.len(), LENGTH_PREFIX_SIZE + 5);
        assert_eq!(&frame[..LENGTH_PREFIX_SIZE], &5u64.to_le_bytes());
        assert_eq!(&frame[LENGTH_PREFIX_SIZE..], &[0xAA; 5]);
    }

    #[test]
    fn test_encode_frame_zero_payload() {
        let message = BytesEnvelope::default();
        let frame = encode_frame(&message, 1024).unwrap();
        assert_eq!(frame, 0u64.to_le_bytes().to_vec());
    }

    #[test]
    fn test_encode_frame_respects_bound() {
        let message = BytesEnvelope::new(vec![0; 2048]);
        let err = encode_frame(&message, 1024).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Framing);
    }

    #[test]
    fn test_terminal_error_classification() {
        assert!(terminal_recv_error(ErrorKind::Eof));
        assert!(terminal_recv_error(ErrorKind::Io));
        assert!(terminal_recv_error(ErrorKind::Framing));
        assert!(!terminal_recv_error(ErrorKind::Parse));
        assert!(!terminal_recv_error(ErrorKind::Busy));
    }
}

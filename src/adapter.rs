//! Process-wide messaging façade.
//!
//! The [`MessagingAdapter`] owns the accepting side of the transport:
//! it binds a TCP acceptor on request, wraps every accepted connection
//! in a back-[`Channel`] indexed by accept order, and drives all of
//! them from one shared reactor. Outbound channels are user-owned; the
//! adapter only establishes and closes them on the caller's behalf.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use futures::future::select_all;
use log::{debug, info, warn};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Notify};

use crate::channel::Channel;
use crate::config::Config;
use crate::endpoint;
use crate::envelope::Envelope;
use crate::error::{Error, ErrorKind, Result};
use crate::reactor::{spawn_worker, Reactor, WorkAnchor};

/// Stream-socket messaging adapter.
///
/// One per process side. All back-channels created from accepted
/// connections share the adapter's reactor and its worker thread.
pub struct MessagingAdapter<M: Envelope> {
    config: Config,
    reactor: Arc<Reactor>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    anchor: Mutex<Option<WorkAnchor>>,
    acceptor: Mutex<Option<Acceptor>>,
    channels: Arc<Mutex<Vec<Arc<Channel<M>>>>>,
    arrived: Arc<Notify>,
    poll_rotation: AtomicUsize,
}

struct Acceptor {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
}

impl<M: Envelope> MessagingAdapter<M> {
    /// Creates an adapter with default configuration.
    pub fn new() -> Result<MessagingAdapter<M>> {
        Self::with_config(Config::default())
    }

    /// Creates an adapter, spinning up its shared reactor and worker.
    ///
    /// The adapter holds a work-anchor for its whole lifetime, so the
    /// worker exits when the adapter is dropped.
    pub fn with_config(config: Config) -> Result<MessagingAdapter<M>> {
        let reactor = Arc::new(Reactor::new()?);
        let anchor = reactor.anchor();
        let worker = spawn_worker(Arc::clone(&reactor))?;
        Ok(MessagingAdapter {
            config,
            reactor,
            worker: Mutex::new(Some(worker)),
            anchor: Mutex::new(Some(anchor)),
            acceptor: Mutex::new(None),
            channels: Arc::new(Mutex::new(Vec::new())),
            arrived: Arc::new(Notify::new()),
            poll_rotation: AtomicUsize::new(0),
        })
    }

    /// Binds the acceptor to `endpoint_uri` and starts accepting.
    ///
    /// Every accepted connection becomes a back-channel, appended to
    /// the accept-order sequence. Fails with [`ErrorKind::Busy`] if the
    /// adapter is already listening.
    pub fn listen(&self, endpoint_uri: &str) -> Result<()> {
        let mut acceptor = self.acceptor.lock().unwrap();
        if acceptor.is_some() {
            return Err(Error::new(ErrorKind::Busy));
        }

        let listen_endpoint = endpoint::parse(endpoint_uri)?;
        let candidates = listen_endpoint.resolve()?;
        let mut last_err = None;
        let mut bound = None;
        for addr in candidates {
            match std::net::TcpListener::bind(addr) {
                Ok(listener) => {
                    bound = Some(listener);
                    break;
                }
                Err(err) => {
                    debug!("could not bind {addr}: {err}");
                    last_err = Some(err);
                }
            }
        }
        let listener = bound.ok_or_else(|| match last_err {
            Some(cause) => Error::with_io(ErrorKind::Bind, cause),
            None => Error::new(ErrorKind::Bind),
        })?;
        listener.set_nonblocking(true)?;
        let listener = {
            let _guard = self.reactor.handle().enter();
            TcpListener::from_std(listener)?
        };
        let addr = listener.local_addr()?;
        info!("adapter listening at {addr}");

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let reactor = Arc::clone(&self.reactor);
        let channels = Arc::clone(&self.channels);
        let arrived = Arc::clone(&self.arrived);
        let config = self.config;
        let accept_anchor = self.reactor.anchor();
        self.reactor.spawn(async move {
            let _anchor = accept_anchor;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        debug!("acceptor shutting down");
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!("adding back-channel for connection from {peer}");
                            let channel =
                                Arc::new(Channel::from_accepted(stream, Arc::clone(&reactor), config));
                            channels.lock().unwrap().push(channel);
                            arrived.notify_one();
                        }
                        Err(err) => {
                            warn!("accept failed: {err}");
                        }
                    }
                }
            }
        });

        *acceptor = Some(Acceptor {
            addr,
            stop: stop_tx,
        });
        Ok(())
    }

    /// True iff the acceptor is bound and accepting.
    pub fn listen_ready(&self) -> bool {
        self.acceptor.lock().unwrap().is_some()
    }

    /// The acceptor's bound address, once listening.
    ///
    /// Needed to dial back a listener bound to an OS-assigned port.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.acceptor.lock().unwrap().as_ref().map(|a| a.addr)
    }

    /// Tears the acceptor down. Existing back-channels keep operating.
    pub fn stop_listen(&self) {
        if let Some(acceptor) = self.acceptor.lock().unwrap().take() {
            let _ = acceptor.stop.send(());
            debug!("stopped listening at {}", acceptor.addr);
        }
    }

    /// Establishes a user-provided outbound channel to `endpoint_uri`.
    pub fn establish(&self, endpoint_uri: &str, channel: &Channel<M>) -> Result<()> {
        debug!("establishing channel to endpoint {endpoint_uri}");
        channel.establish(endpoint_uri)
    }

    /// Closes a user-provided channel.
    pub fn close(&self, channel: &Channel<M>) {
        debug!("shutting down channel");
        channel.close();
    }

    /// Blocks until some back-channel yields one whole message.
    ///
    /// Back-channels are polled starting from a rotating offset, so no
    /// single busy peer can starve the others. Back-channels that fail
    /// terminally are closed and skipped; one with a user receive in
    /// flight is left to that receiver.
    pub fn await_next_message(&self) -> Result<M>
    where
        M: Default,
    {
        let handle = self.reactor.handle().clone();
        handle.block_on(async {
            loop {
                let snapshot: Vec<Arc<Channel<M>>> = {
                    let channels = self.channels.lock().unwrap();
                    channels
                        .iter()
                        .filter(|c| c.ready() && !c.recv_busy())
                        .cloned()
                        .collect()
                };
                let arrived = self.arrived.notified();
                if snapshot.is_empty() {
                    arrived.await;
                    continue;
                }

                let start = self.poll_rotation.fetch_add(1, Ordering::Relaxed) % snapshot.len();
                let waiters: Vec<Pin<Box<dyn Future<Output = (usize, Result<()>)>>>> = (0
                    ..snapshot.len())
                    .map(|offset| {
                        let index = (start + offset) % snapshot.len();
                        let channel = Arc::clone(&snapshot[index]);
                        Box::pin(async move { (index, channel.wait_readable().await) }) as _
                    })
                    .collect();

                tokio::select! {
                    // A new back-channel arrived; rebuild the wait set.
                    _ = arrived => continue,
                    ((index, readiness), _, _) = select_all(waiters) => {
                        if let Err(err) = readiness {
                            debug!("back-channel {index} unusable: {err}");
                            snapshot[index].close();
                            continue;
                        }
                        match snapshot[index].recv_payload().await {
                            Ok(payload) => {
                                let mut message = M::default();
                                if !message.parse(&payload) {
                                    return Err(Error::new(ErrorKind::Parse));
                                }
                                debug!(
                                    "delivering {} payload bytes from back-channel {index}",
                                    payload.len()
                                );
                                return Ok(message);
                            }
                            // Someone queued a receive in the meantime.
                            Err(err) if err.kind() == ErrorKind::Busy => continue,
                            Err(err) => {
                                debug!("receive on back-channel {index} failed: {err}");
                                continue;
                            }
                        }
                    }
                }
            }
        })
    }

    /// Returns the back-channel created by accept number `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range; asking for a connection that
    /// never happened is a programming error.
    pub fn channel_for(&self, index: usize) -> Arc<Channel<M>> {
        let channels = self.channels.lock().unwrap();
        assert!(
            index < channels.len(),
            "back-channel index {index} out of range ({} live)",
            channels.len()
        );
        Arc::clone(&channels[index])
    }

    /// Number of back-channels accepted so far.
    pub fn channel_count(&self) -> usize {
        self.channels.lock().unwrap().len()
    }
}

impl<M: Envelope> Drop for MessagingAdapter<M> {
    fn drop(&mut self) {
        self.stop_listen();
        let channels: Vec<Arc<Channel<M>>> = {
            let mut guard = self.channels.lock().unwrap();
            guard.drain(..).collect()
        };
        for channel in &channels {
            channel.close();
        }
        drop(channels);
        // Releasing the adapter anchor lets the worker drain and exit.
        self.anchor.lock().unwrap().take();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

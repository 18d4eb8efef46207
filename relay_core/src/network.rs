use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use dash_proto::{encode_event_frame, ProtoError, ServerEvent, UpdatePayload, WorldPayload};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

const TARGET: &str = "warehouse_relay::fanout";

/// Encoded, length-prefixed frame shared by every client queue.
pub type Frame = Arc<[u8]>;

#[derive(Debug, Error)]
#[error("client disconnected")]
pub struct SinkClosed;

/// One connected dashboard client as the fan-out sees it.
pub trait ClientSink: Send {
    fn deliver(&mut self, frame: &Frame) -> Result<(), SinkClosed>;

    /// Frames a new client must receive before anything else.
    fn deliver_baseline(&mut self, frames: Vec<Frame>) -> Result<(), SinkClosed> {
        frames.iter().try_for_each(|frame| self.deliver(frame))
    }

    fn label(&self) -> String;
}

/// Broadcast state: the static world frame, the latest full update, and the
/// live clients. Clients whose sink reports closed are dropped.
pub struct FanOut<S> {
    clients: Vec<S>,
    world_frame: Frame,
    baseline: Option<Frame>,
}

impl<S: ClientSink> FanOut<S> {
    pub fn new(world: &WorldPayload) -> Result<Self, ProtoError> {
        let world_frame = encode_event_frame(&ServerEvent::SetWorld(world.clone()))?;
        Ok(Self {
            clients: Vec::new(),
            world_frame: Frame::from(world_frame),
            baseline: None,
        })
    }

    /// Register a client after sending it `set_world` and the latest full update.
    pub fn connect(&mut self, mut client: S) -> bool {
        let mut frames = vec![self.world_frame.clone()];
        frames.extend(self.baseline.clone());
        match client.deliver_baseline(frames) {
            Ok(()) => {
                info!(
                    target: TARGET,
                    client = %client.label(),
                    has_baseline = self.baseline.is_some(),
                    "client.connected"
                );
                self.clients.push(client);
                true
            }
            Err(_) => {
                warn!(target: TARGET, client = %client.label(), "client.baseline_failed");
                false
            }
        }
    }

    pub fn broadcast(&mut self, event: &ServerEvent) -> Result<usize, ProtoError> {
        let frame = Frame::from(encode_event_frame(event)?);
        Ok(self.deliver_all(&frame))
    }

    /// Remember `baseline` for future joiners, then send `delta` to everyone
    /// already connected.
    pub fn publish_update(
        &mut self,
        delta: &UpdatePayload,
        baseline: Option<&UpdatePayload>,
    ) -> Result<usize, ProtoError> {
        if let Some(full) = baseline {
            let frame = encode_event_frame(&ServerEvent::Update(full.clone()))?;
            self.baseline = Some(Frame::from(frame));
        }
        self.broadcast(&ServerEvent::Update(delta.clone()))
    }

    fn deliver_all(&mut self, frame: &Frame) -> usize {
        self.clients.retain_mut(|client| match client.deliver(frame) {
            Ok(()) => true,
            Err(_) => {
                warn!(target: TARGET, client = %client.label(), "client.dropped");
                false
            }
        });
        self.clients.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn has_baseline(&self) -> bool {
        self.baseline.is_some()
    }
}

/// TCP client with a small bounded queue drained by its own writer thread.
/// When the queue is full the oldest pending frame is discarded.
pub struct QueuedClient {
    addr: SocketAddr,
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    stream: Option<TcpStream>,
    closed: Arc<AtomicBool>,
    evicted: Arc<AtomicU64>,
}

impl QueuedClient {
    pub fn new(stream: TcpStream, capacity: usize) -> io::Result<Self> {
        let addr = stream.peer_addr()?;
        if let Err(err) = stream.set_nodelay(true) {
            warn!(target: TARGET, %addr, error = %err, "client.nodelay_failed");
        }
        let (tx, rx) = bounded(capacity.max(1));
        Ok(Self {
            addr,
            tx,
            rx,
            stream: Some(stream),
            closed: Arc::new(AtomicBool::new(false)),
            evicted: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Spawn the writer; `initial` frames are written before the queue is drained.
    fn start(&mut self, initial: Vec<Frame>) -> Result<(), SinkClosed> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        let rx = self.rx.clone();
        let closed = Arc::clone(&self.closed);
        let evicted = Arc::clone(&self.evicted);
        let addr = self.addr;
        thread::Builder::new()
            .name(format!("client-{addr}"))
            .spawn(move || {
                let frames = initial.into_iter().chain(rx.iter());
                for frame in frames {
                    if let Err(err) = stream.write_all(&frame) {
                        debug!(target: TARGET, %addr, error = %err, "client.write_failed");
                        break;
                    }
                }
                closed.store(true, Ordering::Release);
                debug!(target: TARGET, %addr, evicted = evicted.load(Ordering::Relaxed), "client.writer_stopped");
            })
            .map(|_| ())
            .map_err(|_| SinkClosed)
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl ClientSink for QueuedClient {
    fn deliver(&mut self, frame: &Frame) -> Result<(), SinkClosed> {
        if self.stream.is_some() {
            self.start(Vec::new())?;
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkClosed);
        }
        let mut pending = frame.clone();
        loop {
            match self.tx.try_send(pending) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(back)) => {
                    // latest wins
                    if self.rx.try_recv().is_ok() {
                        self.evicted.fetch_add(1, Ordering::Relaxed);
                        trace!(target: TARGET, addr = %self.addr, evicted = self.evicted(), "client.frame_evicted");
                    }
                    pending = back;
                }
                Err(TrySendError::Disconnected(_)) => return Err(SinkClosed),
            }
        }
    }

    fn deliver_baseline(&mut self, frames: Vec<Frame>) -> Result<(), SinkClosed> {
        if self.stream.is_some() {
            self.start(frames)
        } else {
            frames.iter().try_for_each(|frame| self.deliver(frame))
        }
    }

    fn label(&self) -> String {
        self.addr.to_string()
    }
}

/// Anything the tick pump can hand an update to.
pub trait UpdatePublisher {
    fn publish_update(
        &self,
        delta: &UpdatePayload,
        baseline: Option<&UpdatePayload>,
    ) -> Result<usize, ProtoError>;
}

impl<S: ClientSink> UpdatePublisher for Mutex<FanOut<S>> {
    fn publish_update(
        &self,
        delta: &UpdatePayload,
        baseline: Option<&UpdatePayload>,
    ) -> Result<usize, ProtoError> {
        self.lock().publish_update(delta, baseline)
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind dashboard listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Encode(#[from] ProtoError),
}

/// Push-channel server handle. Clones share the same client set.
#[derive(Clone)]
pub struct DashboardServer {
    fanout: Arc<Mutex<FanOut<QueuedClient>>>,
    local_addr: SocketAddr,
}

impl DashboardServer {
    pub fn start(
        bind: SocketAddr,
        world: &WorldPayload,
        queue_capacity: usize,
    ) -> Result<Self, ServerError> {
        let listener =
            TcpListener::bind(bind).map_err(|source| ServerError::Bind { addr: bind, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr: bind, source })?;
        let fanout = Arc::new(Mutex::new(FanOut::new(world)?));
        let accept_fanout = Arc::clone(&fanout);

        thread::spawn(move || {
            for incoming in listener.incoming() {
                let stream = match incoming {
                    Ok(stream) => stream,
                    Err(err) => {
                        warn!(target: TARGET, error = %err, "client.accept_failed");
                        continue;
                    }
                };
                match QueuedClient::new(stream, queue_capacity) {
                    // Under the broadcast lock, so no update can slip in
                    // between the baseline and the first queued frame.
                    Ok(client) => {
                        accept_fanout.lock().connect(client);
                    }
                    Err(err) => warn!(target: TARGET, error = %err, "client.setup_failed"),
                }
            }
        });

        info!(target: TARGET, %local_addr, "fanout.listening");
        Ok(Self { fanout, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn client_count(&self) -> usize {
        self.fanout.lock().client_count()
    }

    pub fn broadcast(&self, event: &ServerEvent) -> Result<usize, ProtoError> {
        self.fanout.lock().broadcast(event)
    }
}

impl UpdatePublisher for DashboardServer {
    fn publish_update(
        &self,
        delta: &UpdatePayload,
        baseline: Option<&UpdatePayload>,
    ) -> Result<usize, ProtoError> {
        self.fanout.lock().publish_update(delta, baseline)
    }
}

//! Batched message transport
//!
//! Exchanges whole batches of [`Message`]s with a single peer over short-lived
//! TCP connections. Each loop iteration is one round trip: the client connects
//! only when it has something queued, the server accepts one connection per
//! poll interval and answers with whatever it has queued. There is no
//! acknowledgment or retransmission; a batch lost in transit is gone and the
//! session layer resynchronizes through periodic state requests.

mod queue;

pub use queue::OutboundQueue;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::RuntimeFlavor;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::TransportConfig;
use crate::protocol::codec::{self, CodecError};
use crate::protocol::Message;

/// Idle server polls without a peer before the link is reported down
const SERVER_IDLE_ROUNDS_BEFORE_DISCONNECT: u32 = 4;

/// Which side of the exchange this transport plays
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Listen on `127.0.0.1:port`; port 0 picks a free port
    Server { port: u16 },
    /// Connect to `host:port` whenever there is something to send
    Client { host: String, port: u16 },
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Server { port } => write!(f, "server on port {}", port),
            Role::Client { host, port } => write!(f, "client of {}:{}", host, port),
        }
    }
}

/// Callbacks invoked from the transport loop.
///
/// Implementations run on the loop's task and may block briefly (file I/O);
/// they must not call [`Transport::stop`].
pub trait TransportListener: Send + Sync {
    /// A batch arrived from the peer
    fn on_message_batch(&self, messages: &[Message]);

    /// Start of a loop iteration, before the outbound queue is drained
    fn before_routine(&self) {}

    /// End of a loop iteration
    fn after_routine(&self) {}

    /// The peer answered after being unreachable (or never seen)
    fn on_connect(&self) {}

    /// The peer stopped answering
    fn on_disconnect(&self) {}
}

/// Where the session layer puts outgoing messages
pub trait MessageSink: Send + Sync {
    /// Enqueue without blocking; dropped if the transport is not running
    fn send(&self, message: Message);

    /// Number of messages waiting for the next round trip
    fn pending_count(&self) -> usize;
}

/// Handle to the background transport loop
pub struct Transport {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct RunningGuard(OutboundQueue);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.set_running(false);
    }
}

/// Run blocking code from the async side. `block_in_place` is only available
/// on a multi-thread runtime; anywhere else the closure runs inline.
pub(crate) fn run_blocking<R>(f: impl FnOnce() -> R) -> R {
    match tokio::runtime::Handle::try_current().map(|handle| handle.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(f),
        _ => f(),
    }
}

struct Shared {
    role: Role,
    poll_interval: Duration,
    io_timeout: Duration,
    queue: OutboundQueue,
    listeners: Mutex<Vec<Weak<dyn TransportListener>>>,
    /// `None` until the first round trip succeeds or fails
    link_up: Mutex<Option<bool>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Transport {
    pub fn new(role: Role, poll_interval: Duration, io_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                role,
                poll_interval,
                io_timeout,
                queue: OutboundQueue::new(),
                listeners: Mutex::new(Vec::new()),
                link_up: Mutex::new(None),
                local_addr: Mutex::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Client of the configured peer
    pub fn client(config: &TransportConfig) -> Self {
        Self::new(
            Role::Client {
                host: config.host.clone(),
                port: config.port,
            },
            config.poll_interval(),
            config.io_timeout(),
        )
    }

    /// Server listening on `port`
    pub fn server(port: u16, config: &TransportConfig) -> Self {
        Self::new(Role::Server { port }, config.poll_interval(), config.io_timeout())
    }

    pub fn role(&self) -> &Role {
        &self.shared.role
    }

    /// Spawn the loop on the current tokio runtime, restarting it if it was
    /// already running.
    ///
    /// In the server role the port is bound before this returns when possible;
    /// otherwise the loop keeps retrying the bind every poll interval.
    pub async fn start(&self) {
        self.stop().await;

        let listener = match &self.shared.role {
            Role::Server { port } => match TcpListener::bind(("127.0.0.1", *port)).await {
                Ok(listener) => {
                    self.shared.set_local_addr(listener.local_addr().ok());
                    Some(listener)
                }
                Err(e) => {
                    error!("Failed to bind port {}: {}", port, e);
                    None
                }
            },
            Role::Client { .. } => None,
        };

        let cancel = CancellationToken::new();
        let shared = self.shared.clone();
        let token = cancel.clone();
        shared.queue.set_running(true);

        let handle = tokio::spawn(async move {
            // Cleared even if a listener panics and takes the loop down
            let _running = RunningGuard(shared.queue.clone());
            shared.run(token, listener).await;
        });

        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(Worker { cancel, handle });
    }

    /// Request cancellation and wait for the loop to exit.
    ///
    /// An exchange already in flight is allowed to finish (bounded by the I/O
    /// timeout); waits between rounds are interrupted.
    pub async fn stop(&self) {
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker {
            worker.cancel.cancel();
            if let Err(e) = worker.handle.await {
                warn!("Transport loop ended abnormally: {}", e);
            }
        }
        self.shared.queue.set_running(false);
        *self.shared.link_up.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn is_running(&self) -> bool {
        self.shared.queue.is_running()
    }

    /// Bound address in the server role, once bound
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a listener. Only a weak reference is kept; dropping the last
    /// `Arc` unregisters it implicitly.
    pub fn add_listener<L: TransportListener + 'static>(&self, listener: &Arc<L>) {
        let weak: Weak<L> = Arc::downgrade(listener);
        let weak: Weak<dyn TransportListener> = weak;
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(weak);
    }

    pub fn remove_listener<L: TransportListener + 'static>(&self, listener: &Arc<L>) {
        let target: Weak<L> = Arc::downgrade(listener);
        let target: Weak<dyn TransportListener> = target;
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|weak| !weak.ptr_eq(&target));
    }

    #[cfg(test)]
    fn listener_count(&self) -> usize {
        self.shared.live_listeners().len()
    }
}

impl MessageSink for Transport {
    fn send(&self, message: Message) {
        if !self.shared.queue.push(message) {
            debug!("Transport not running, message dropped");
        }
    }

    fn pending_count(&self) -> usize {
        self.shared.queue.len()
    }
}

impl Shared {
    async fn run(self: Arc<Self>, cancel: CancellationToken, listener: Option<TcpListener>) {
        info!("Transport loop started ({})", self.role);
        match &self.role {
            Role::Server { port } => self.run_server(*port, listener, &cancel).await,
            Role::Client { host, port } => self.run_client(host, *port, &cancel).await,
        }
        info!("Transport loop finished ({})", self.role);
    }

    async fn run_server(&self, port: u16, listener: Option<TcpListener>, cancel: &CancellationToken) {
        let listener = match listener {
            Some(listener) => listener,
            None => loop {
                if !self.pause(cancel).await {
                    return;
                }
                match TcpListener::bind(("127.0.0.1", port)).await {
                    Ok(listener) => {
                        self.set_local_addr(listener.local_addr().ok());
                        break listener;
                    }
                    Err(e) => debug!("Bind retry on port {} failed: {}", port, e),
                }
            },
        };

        let mut idle_rounds: u32 = 0;
        while !cancel.is_cancelled() {
            self.notify(|l| l.before_routine());

            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                result = tokio::time::timeout(self.poll_interval, listener.accept()) => result,
            };

            match accepted {
                Err(_) => {
                    idle_rounds = idle_rounds.saturating_add(1);
                    if idle_rounds >= SERVER_IDLE_ROUNDS_BEFORE_DISCONNECT {
                        self.set_link(false);
                    }
                }
                Ok(Err(e)) => debug!("Accept failed: {}", e),
                Ok(Ok((stream, peer))) => {
                    idle_rounds = 0;
                    match tokio::time::timeout(self.io_timeout, self.serve(stream)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) if e.is_decode() => {
                            error!("Invalid batch from {}: {}", peer, e);
                        }
                        Ok(Err(e)) if e.is_encode() => {
                            error!("Response to {} dropped, cannot be sent: {}", peer, e);
                        }
                        Ok(Err(e)) => debug!("Exchange with {} failed: {}", peer, e),
                        Err(_) => warn!("Exchange with {} timed out", peer),
                    }
                }
            }

            self.notify(|l| l.after_routine());
        }
    }

    /// Read one batch, dispatch it, answer with the outbound queue
    async fn serve(&self, mut stream: TcpStream) -> Result<(), CodecError> {
        let Some(inbound) = codec::read_batch(&mut stream).await? else {
            debug!("Peer closed without sending a batch");
            return Ok(());
        };
        debug!("LISTEN: {} messages", inbound.len());
        self.set_link(true);
        self.dispatch(&inbound);

        if let Some(outbound) = self.queue.pop_all() {
            debug!("RESPOND: {} messages", outbound.len());
            codec::write_batch(&mut stream, &outbound).await?;
        }
        stream.shutdown().await?;
        Ok(())
    }

    async fn run_client(&self, host: &str, port: u16, cancel: &CancellationToken) {
        while !cancel.is_cancelled() {
            self.notify(|l| l.before_routine());

            if let Some(outbound) = self.queue.pop_all() {
                self.round_trip(host, port, &outbound).await;
            }

            self.notify(|l| l.after_routine());

            if !self.pause(cancel).await {
                break;
            }
        }
    }

    /// Send one batch and dispatch the answer, updating the link state
    async fn round_trip(&self, host: &str, port: u16, outbound: &[Message]) {
        let frame = match codec::encode_frame(outbound) {
            Ok(frame) => frame,
            Err(e) => {
                error!(
                    "Dropping {} outgoing messages that cannot be sent: {}",
                    outbound.len(),
                    e
                );
                return;
            }
        };

        let exchange = self.exchange(host, port, &frame, outbound.len());
        match tokio::time::timeout(self.io_timeout, exchange).await {
            Ok(Ok(Some(inbound))) => {
                debug!("RECEIVE: {} messages", inbound.len());
                self.set_link(true);
                self.dispatch(&inbound);
            }
            Ok(Ok(None)) => self.set_link(true),
            Ok(Err(e)) if e.is_decode() => {
                self.set_link(true);
                error!("Discarding invalid batch from {}:{}: {}", host, port, e);
            }
            Ok(Err(e)) => {
                debug!(
                    "Round trip to {}:{} failed, {} messages dropped: {}",
                    host,
                    port,
                    outbound.len(),
                    e
                );
                self.set_link(false);
            }
            Err(_) => {
                warn!("Round trip to {}:{} timed out", host, port);
                self.set_link(false);
            }
        }
    }

    async fn exchange(
        &self,
        host: &str,
        port: u16,
        frame: &[u8],
        count: usize,
    ) -> Result<Option<Vec<Message>>, CodecError> {
        let mut stream = TcpStream::connect((host, port)).await?;
        codec::write_frame(&mut stream, frame).await?;
        debug!("SEND: {} messages", count);
        codec::read_batch(&mut stream).await
    }

    /// Sleep one poll interval. Returns false if cancelled meanwhile.
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.poll_interval) => true,
        }
    }

    fn set_link(&self, up: bool) {
        let changed = {
            let mut link = self.link_up.lock().unwrap_or_else(PoisonError::into_inner);
            let changed = *link != Some(up);
            *link = Some(up);
            changed
        };
        if !changed {
            return;
        }

        if up {
            info!("Peer reachable ({})", self.role);
            self.notify(|l| l.on_connect());
        } else {
            warn!("Peer unreachable ({})", self.role);
            self.notify(|l| l.on_disconnect());
        }
    }

    fn set_local_addr(&self, addr: Option<SocketAddr>) {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = addr;
    }

    fn dispatch(&self, messages: &[Message]) {
        self.notify(|l| l.on_message_batch(messages));
    }

    /// Invoke `f` on every live listener. Listener code may block, so it is
    /// run through [`run_blocking`].
    fn notify<F>(&self, f: F)
    where
        F: Fn(&dyn TransportListener),
    {
        let listeners = self.live_listeners();
        if listeners.is_empty() {
            return;
        }
        run_blocking(|| {
            for listener in &listeners {
                f(listener.as_ref());
            }
        });
    }

    fn live_listeners(&self) -> Vec<Arc<dyn TransportListener>> {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|weak| weak.strong_count() > 0);
        listeners.iter().filter_map(Weak::upgrade).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, ServiceState};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<Vec<Message>>>,
        routines: AtomicUsize,
        connects: AtomicUsize,
        disconnects: AtomicUsize,
    }

    impl TransportListener for Recorder {
        fn on_message_batch(&self, messages: &[Message]) {
            self.batches.lock().unwrap().push(messages.to_vec());
        }

        fn before_routine(&self) {
            self.routines.fetch_add(1, Ordering::SeqCst);
        }

        fn on_connect(&self) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }

        fn on_disconnect(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FailingListener;

    impl TransportListener for FailingListener {
        fn on_message_batch(&self, _messages: &[Message]) {}

        fn before_routine(&self) {
            panic!("listener failure");
        }
    }

    fn fast(role: Role) -> Transport {
        Transport::new(role, Duration::from_millis(20), Duration::from_secs(2))
    }

    async fn wait_until(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_send_is_noop_when_not_running() {
        let transport = fast(Role::Client {
            host: "127.0.0.1".to_string(),
            port: 1,
        });
        transport.send(Command::RequestState.into());
        assert_eq!(transport.pending_count(), 0);
        assert!(!transport.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_client_and_server_exchange_batches() {
        let server = fast(Role::Server { port: 0 });
        let server_rec = Arc::new(Recorder::default());
        server.add_listener(&server_rec);
        server.start().await;
        let port = server.local_addr().unwrap().port();
        server.send(ServiceState::Idle.into());

        let client = fast(Role::Client {
            host: "127.0.0.1".to_string(),
            port,
        });
        let client_rec = Arc::new(Recorder::default());
        client.add_listener(&client_rec);
        client.start().await;
        client.send(Command::RecordingOn.into());

        assert!(wait_until(|| !client_rec.batches.lock().unwrap().is_empty()).await);

        assert_eq!(
            server_rec.batches.lock().unwrap()[0],
            vec![Message::Command(Command::RecordingOn)]
        );
        assert_eq!(
            client_rec.batches.lock().unwrap()[0],
            vec![Message::ServiceState(ServiceState::Idle)]
        );
        assert_eq!(client_rec.connects.load(Ordering::SeqCst), 1);
        assert_eq!(server_rec.connects.load(Ordering::SeqCst), 1);

        client.stop().await;
        server.stop().await;
        assert!(!client.is_running());
        assert!(!server.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_client_with_empty_queue_never_connects() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = fast(Role::Client {
            host: "127.0.0.1".to_string(),
            port,
        });
        let rec = Arc::new(Recorder::default());
        client.add_listener(&rec);
        client.start().await;

        assert!(wait_until(|| rec.routines.load(Ordering::SeqCst) >= 5).await);
        client.stop().await;

        let accepted = listener.accept();
        assert!(matches!(accepted, Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock));
        assert_eq!(rec.connects.load(Ordering::SeqCst), 0);
        assert_eq!(rec.disconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unreachable_peer_is_reported_and_loop_survives() {
        let client = fast(Role::Client {
            host: "127.0.0.1".to_string(),
            port: free_port(),
        });
        let rec = Arc::new(Recorder::default());
        client.add_listener(&rec);
        client.start().await;
        client.send(Command::RequestState.into());

        assert!(wait_until(|| rec.disconnects.load(Ordering::SeqCst) == 1).await);
        let routines = rec.routines.load(Ordering::SeqCst);
        assert!(wait_until(|| rec.routines.load(Ordering::SeqCst) > routines + 2).await);
        assert!(client.is_running());
        // Lost, not retried
        assert_eq!(client.pending_count(), 0);

        client.stop().await;
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn test_loop_runs_on_current_thread_runtime() {
        let client = fast(Role::Client {
            host: "127.0.0.1".to_string(),
            port: free_port(),
        });
        let rec = Arc::new(Recorder::default());
        client.add_listener(&rec);
        client.start().await;

        assert!(wait_until(|| rec.routines.load(Ordering::SeqCst) >= 3).await);
        client.send(Command::RequestState.into());
        assert!(wait_until(|| rec.disconnects.load(Ordering::SeqCst) == 1).await);
        assert!(client.is_running());

        client.stop().await;
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn test_dead_loop_stops_accepting_messages() {
        let client = fast(Role::Client {
            host: "127.0.0.1".to_string(),
            port: 1,
        });
        let failing = Arc::new(FailingListener);
        client.add_listener(&failing);
        client.start().await;

        assert!(wait_until(|| !client.is_running()).await);
        client.send(Command::RequestState.into());
        assert_eq!(client.pending_count(), 0);

        client.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_listener_is_released() {
        let client = fast(Role::Client {
            host: "127.0.0.1".to_string(),
            port: 1,
        });
        let kept = Arc::new(Recorder::default());
        let dropped = Arc::new(Recorder::default());
        client.add_listener(&kept);
        client.add_listener(&dropped);
        assert_eq!(client.listener_count(), 2);

        drop(dropped);
        assert_eq!(client.listener_count(), 1);

        client.remove_listener(&kept);
        assert_eq!(client.listener_count(), 0);
    }
}

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::codec::{Command, Frame, RESPONSE_CLOSE_WAIT, RESPONSE_HEARTBEAT};
use crate::config::{Config, validate_name};
use crate::conn::{self, NsqFramed};
use crate::error::NsqError;
use crate::lookup;
use crate::message::{Message, Responder};

/// Upper bound for per-consumer channel buffers.
const MAX_BUFFER: usize = 1 << 16;

/// Receives every message delivered to a consumer.
///
/// The handler owns the response: it must `finish`, `requeue` or leave the
/// message to time out on nsqd.
pub trait Handler: Send + Sync + 'static {
    fn handle_message<'a>(
        &'a self,
        message: &'a Message,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// Lifecycle of a consumer. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConsumerState {
    Created,
    /// Attached to the broker set (subscribed, or registered with nsqlookupd).
    Connected,
    /// At least one connection has announced its RDY budget.
    Running,
    Stopping,
    Stopped,
}

/// Subscription of one `(topic, channel)` pair across any number of nsqd nodes.
pub struct Consumer {
    inner: Arc<Inner>,
}

struct Inner {
    topic: String,
    channel: String,
    config: Config,
    handler: Mutex<Option<Arc<dyn Handler>>>,
    state: watch::Sender<ConsumerState>,
    token: CancellationToken,
    tracker: TaskTracker,
    /// Live connections keyed by nsqd address.
    conns: Mutex<HashMap<String, mpsc::Sender<Command>>>,
    /// Addresses given explicitly; these are re-dialled when lost.
    direct: Mutex<HashSet<String>>,
    deliveries: Mutex<Option<mpsc::Sender<Message>>>,
    /// Receiver parked here until the handler workers start.
    pending_rx: Mutex<Option<mpsc::Receiver<Message>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::warn!("consumer lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

fn buffer_size(n: u64) -> usize {
    usize::try_from(n).unwrap_or(MAX_BUFFER).clamp(1, MAX_BUFFER)
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("topic", &self.inner.topic)
            .field("channel", &self.inner.channel)
            .field("state", &self.state())
            .finish()
    }
}

impl Consumer {
    pub fn new(
        topic: impl Into<String>,
        channel: impl Into<String>,
        config: Config,
    ) -> Result<Self, NsqError> {
        let topic = topic.into();
        let channel = channel.into();
        validate_name("topic", &topic)?;
        validate_name("channel", &channel)?;

        let (tx, rx) = mpsc::channel(buffer_size(config.max_in_flight));
        let (state, _) = watch::channel(ConsumerState::Created);

        Ok(Self {
            inner: Arc::new(Inner {
                topic,
                channel,
                config,
                handler: Mutex::new(None),
                state,
                token: CancellationToken::new(),
                tracker: TaskTracker::new(),
                conns: Mutex::new(HashMap::new()),
                direct: Mutex::new(HashSet::new()),
                deliveries: Mutex::new(Some(tx)),
                pending_rx: Mutex::new(Some(rx)),
            }),
        })
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    pub fn state(&self) -> ConsumerState {
        *self.inner.state.borrow()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.inner.conns).len()
    }

    /// Attach the message handler. Exactly one handler per consumer.
    pub fn add_handler<H: Handler>(&self, handler: H) -> Result<(), NsqError> {
        let mut slot = lock(&self.inner.handler);
        if slot.is_some() {
            return Err(NsqError::HandlerAlreadySet(self.inner.topic.clone()));
        }
        *slot = Some(Arc::new(handler));
        Ok(())
    }

    /// Connect straight to nsqd nodes. Any failed dial fails the call.
    pub async fn connect_to_nsqds(&self, addrs: &[String]) -> Result<(), NsqError> {
        if addrs.is_empty() {
            return Err(NsqError::NoAddresses("nsqd"));
        }
        self.inner.ensure_running_allowed()?;
        self.inner.start_workers()?;

        for addr in addrs {
            lock(&self.inner.direct).insert(addr.clone());
            self.inner.connect_to_nsqd(addr.clone()).await?;
        }
        Ok(())
    }

    /// Discover nsqd nodes through nsqlookupd and keep polling for new ones.
    ///
    /// Lookup failures are logged, not returned: producers may appear later.
    pub async fn connect_to_nsqlookupds(&self, addrs: &[String]) -> Result<(), NsqError> {
        if addrs.is_empty() {
            return Err(NsqError::NoAddresses("nsqlookupd"));
        }
        self.inner.ensure_running_allowed()?;
        self.inner.start_workers()?;

        let http = reqwest::Client::builder()
            .connect_timeout(self.inner.config.dial_timeout)
            .timeout(self.inner.config.read_timeout)
            .build()
            .map_err(|e| NsqError::Lookup { addr: addrs.join(","), detail: e.to_string() })?;

        self.inner.advance(ConsumerState::Connected);
        self.inner.query_lookupds(&http, addrs).await;

        let inner = self.inner.clone();
        let lookupds = addrs.to_vec();
        self.inner.tracker.spawn(inner.poll_lookupds(http, lookupds));
        tracing::info!(
            topic = %self.inner.topic,
            channel = %self.inner.channel,
            lookupds = ?addrs,
            "polling nsqlookupd"
        );
        Ok(())
    }

    /// Begin the stop sequence: CLS on every connection, drain in-flight
    /// messages, then resolve `stopped()`. Repeated calls are no-ops.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn stop(&self) {
        let inner = &self.inner;
        let began = inner.state.send_if_modified(|s| {
            if *s < ConsumerState::Stopping {
                *s = ConsumerState::Stopping;
                true
            } else {
                false
            }
        });
        if !began {
            return;
        }

        tracing::info!(topic = %inner.topic, channel = %inner.channel, "stopping consumer");
        inner.token.cancel();
        lock(&inner.deliveries).take();
        lock(&inner.pending_rx).take();
        inner.tracker.close();

        let inner = inner.clone();
        tokio::spawn(async move {
            inner.tracker.wait().await;
            inner.state.send_replace(ConsumerState::Stopped);
            tracing::info!(topic = %inner.topic, channel = %inner.channel, "consumer stopped");
        });
    }

    /// Resolves once the consumer reached `Stopped`.
    pub async fn stopped(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|s| *s == ConsumerState::Stopped).await;
    }
}

impl Inner {
    fn ensure_running_allowed(&self) -> Result<(), NsqError> {
        if *self.state.borrow() >= ConsumerState::Stopping {
            return Err(NsqError::Stopped(self.topic.clone()));
        }
        Ok(())
    }

    fn advance(&self, to: ConsumerState) {
        self.state.send_if_modified(|s| {
            if *s < to && *s < ConsumerState::Stopping {
                *s = to;
                true
            } else {
                false
            }
        });
    }

    fn rdy_per_connection(&self, connections: usize) -> u64 {
        (self.config.max_in_flight / connections.max(1) as u64).max(1)
    }

    fn start_workers(&self) -> Result<(), NsqError> {
        let handler = lock(&self.handler)
            .clone()
            .ok_or_else(|| NsqError::NoHandler(self.topic.clone()))?;
        let Some(rx) = lock(&self.pending_rx).take() else {
            return Ok(());
        };

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for worker in 0..self.config.concurrency.max(1) {
            let rx = rx.clone();
            let handler = handler.clone();
            let topic = self.topic.clone();
            self.tracker.spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(message) = next else { break };
                    handler.handle_message(&message).await;
                    if !message.is_responded() {
                        tracing::warn!(
                            %topic,
                            id = %message.id,
                            "handler returned without responding, nsqd will time the message out"
                        );
                    }
                }
                tracing::debug!(%topic, worker, "handler worker finished");
            });
        }
        Ok(())
    }

    fn connect_to_nsqd(
        self: &Arc<Self>,
        addr: String,
    ) -> Pin<Box<dyn Future<Output = Result<(), NsqError>> + Send + 'static>> {
        let inner = self.clone();
        Box::pin(async move {
            inner.ensure_running_allowed()?;
            if lock(&inner.conns).contains_key(&addr) {
                tracing::debug!(topic = %inner.topic, nsqd = %addr, "already connected");
                return Ok(());
            }

            let wt = inner.config.write_timeout;
            let mut framed = conn::dial(&addr, &inner.config).await?;
            conn::send(
                &mut framed,
                Command::Sub { topic: inner.topic.clone(), channel: inner.channel.clone() },
                wt,
            )
            .await?;
            conn::expect_ok(&mut framed, &inner.config).await?;
            inner.advance(ConsumerState::Connected);

            let deliveries = lock(&inner.deliveries)
                .clone()
                .ok_or_else(|| NsqError::Stopped(inner.topic.clone()))?;
            let (cmd_tx, cmd_rx) =
                mpsc::channel(buffer_size(inner.config.max_in_flight.saturating_add(16)));

            let rdy = {
                let mut conns = lock(&inner.conns);
                conns.insert(addr.clone(), cmd_tx.clone());
                let per_conn = inner.rdy_per_connection(conns.len());
                for (other, tx) in conns.iter() {
                    if other != &addr {
                        let _ = tx.try_send(Command::Rdy(per_conn));
                    }
                }
                per_conn
            };
            if let Err(e) = conn::send(&mut framed, Command::Rdy(rdy), wt).await {
                inner.remove_connection(&addr);
                return Err(e);
            }
            inner.advance(ConsumerState::Running);
            tracing::info!(
                topic = %inner.topic,
                channel = %inner.channel,
                nsqd = %addr,
                rdy,
                "subscribed"
            );

            let task_inner = inner.clone();
            inner
                .tracker
                .spawn(task_inner.run_connection(addr, framed, cmd_tx, cmd_rx, deliveries));
            Ok(())
        })
    }

    async fn run_connection(
        self: Arc<Self>,
        addr: String,
        mut framed: NsqFramed,
        cmd_tx: mpsc::Sender<Command>,
        mut cmd_rx: mpsc::Receiver<Command>,
        deliveries: mpsc::Sender<Message>,
    ) {
        let wt = self.config.write_timeout;
        let mut in_flight: u64 = 0;
        let mut closing = false;
        let mut drain_deadline: Option<Instant> = None;
        let mut read_deadline = Instant::now() + self.config.read_timeout;

        loop {
            tokio::select! {
                _ = self.token.cancelled(), if !closing => {
                    closing = true;
                    drain_deadline = Some(Instant::now() + self.config.drain_timeout);
                    if let Err(e) = conn::send(&mut framed, Command::Cls, wt).await {
                        tracing::warn!(nsqd = %addr, error = %e, "CLS failed");
                        break;
                    }
                }
                frame = framed.next() => {
                    read_deadline = Instant::now() + self.config.read_timeout;
                    match frame {
                        Some(Ok(Frame::Response(data))) if data.as_ref() == RESPONSE_HEARTBEAT => {
                            if let Err(e) = conn::send(&mut framed, Command::Nop, wt).await {
                                tracing::warn!(nsqd = %addr, error = %e, "heartbeat reply failed");
                                break;
                            }
                        }
                        Some(Ok(Frame::Response(data))) if data.as_ref() == RESPONSE_CLOSE_WAIT => {
                            tracing::debug!(nsqd = %addr, in_flight, "nsqd acknowledged CLS");
                            if in_flight == 0 {
                                break;
                            }
                        }
                        Some(Ok(Frame::Response(data))) => {
                            tracing::debug!(nsqd = %addr, response = %String::from_utf8_lossy(&data), "response");
                        }
                        Some(Ok(Frame::Error(data))) => {
                            tracing::warn!(nsqd = %addr, error = %String::from_utf8_lossy(&data), "nsqd error frame");
                        }
                        Some(Ok(Frame::Message(data))) => {
                            match Message::decode(data, &addr, Responder::new(cmd_tx.clone())) {
                                Ok(message) => {
                                    in_flight += 1;
                                    if deliveries.send(message).await.is_err() {
                                        tracing::warn!(nsqd = %addr, "handlers gone, message left to time out");
                                    }
                                }
                                Err(e) => {
                                    tracing::error!(nsqd = %addr, error = %e, "undecodable message");
                                    break;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            tracing::error!(nsqd = %addr, error = %e, "read error");
                            break;
                        }
                        None => {
                            tracing::info!(nsqd = %addr, "connection closed by nsqd");
                            break;
                        }
                    }
                }
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    let releases = cmd.releases_message();
                    if let Err(e) = conn::send(&mut framed, cmd, wt).await {
                        tracing::error!(nsqd = %addr, error = %e, "write error");
                        break;
                    }
                    if releases {
                        in_flight = in_flight.saturating_sub(1);
                        if closing && in_flight == 0 {
                            break;
                        }
                    }
                }
                _ = sleep_until(read_deadline) => {
                    tracing::warn!(nsqd = %addr, timeout = ?self.config.read_timeout, "no data from nsqd, dropping connection");
                    break;
                }
                _ = sleep_until(drain_deadline.unwrap_or_else(Instant::now)), if drain_deadline.is_some() => {
                    tracing::warn!(nsqd = %addr, in_flight, "drain timeout, closing with unfinished messages");
                    break;
                }
            }
        }

        self.remove_connection(&addr);
        tracing::debug!(topic = %self.topic, nsqd = %addr, "connection finished");

        if !self.token.is_cancelled() && lock(&self.direct).contains(&addr) {
            let inner = self.clone();
            self.tracker.spawn(inner.reconnect(addr));
        }
    }

    /// Drop `addr` and hand its share of the RDY budget to the survivors.
    fn remove_connection(&self, addr: &str) {
        let mut conns = lock(&self.conns);
        if conns.remove(addr).is_none() || conns.is_empty() || self.token.is_cancelled() {
            return;
        }
        let per_conn = self.rdy_per_connection(conns.len());
        for (other, tx) in conns.iter() {
            if let Err(e) = tx.try_send(Command::Rdy(per_conn)) {
                tracing::debug!(nsqd = %other, error = %e, "RDY update not queued");
            }
        }
        tracing::debug!(topic = %self.topic, connections = conns.len(), rdy = per_conn, "RDY rebalanced");
    }

    async fn reconnect(self: Arc<Self>, addr: String) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = sleep(self.config.reconnect_interval) => {}
            }
            match self.connect_to_nsqd(addr.clone()).await {
                Ok(()) => {
                    tracing::info!(topic = %self.topic, nsqd = %addr, "reconnected");
                    return;
                }
                Err(NsqError::Stopped(_)) => return,
                Err(e) => {
                    tracing::warn!(topic = %self.topic, nsqd = %addr, error = %e, "reconnect failed");
                }
            }
        }
    }

    async fn query_lookupds(self: &Arc<Self>, http: &reqwest::Client, lookupds: &[String]) {
        for lookupd in lookupds {
            match lookup::query_lookupd(http, lookupd, &self.topic).await {
                Ok(producers) => {
                    for addr in producers {
                        if lock(&self.conns).contains_key(&addr) {
                            continue;
                        }
                        if let Err(e) = self.connect_to_nsqd(addr.clone()).await {
                            tracing::warn!(topic = %self.topic, nsqd = %addr, error = %e, "connect to discovered nsqd failed");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(topic = %self.topic, %lookupd, error = %e, "lookup failed");
                }
            }
        }
    }

    async fn poll_lookupds(self: Arc<Self>, http: reqwest::Client, lookupds: Vec<String>) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = sleep(self.config.lookupd_poll_interval) => {}
            }
            self.query_lookupds(&http, &lookupds).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

    use super::*;

    struct Finisher {
        seen: Arc<AtomicUsize>,
    }

    impl Handler for Finisher {
        fn handle_message<'a>(
            &'a self,
            message: &'a Message,
        ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
            Box::pin(async move {
                self.seen.fetch_add(1, Ordering::SeqCst);
                let _ = message.finish().await;
            })
        }
    }

    async fn write_frame(w: &mut OwnedWriteHalf, frame_type: u32, data: &[u8]) {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((data.len() + 4) as u32).to_be_bytes());
        buf.extend_from_slice(&frame_type.to_be_bytes());
        buf.extend_from_slice(data);
        w.write_all(&buf).await.unwrap();
    }

    fn message_data(id: &[u8; 16], body: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&0i64.to_be_bytes());
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(id);
        data.extend_from_slice(body);
        data
    }

    async fn read_line(r: &mut BufReader<OwnedReadHalf>) -> String {
        let mut line = String::new();
        r.read_line(&mut line).await.unwrap();
        line
    }

    /// Accepts one client and answers `OK` to IDENTIFY and SUB. Returns the SUB line.
    async fn accept_subscriber(
        listener: &TcpListener,
    ) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf, String) {
        let (socket, _) = listener.accept().await.unwrap();
        let (r, mut w) = socket.into_split();
        let mut r = BufReader::new(r);

        let mut magic = [0u8; 4];
        r.read_exact(&mut magic).await.unwrap();
        assert_eq!(read_line(&mut r).await, "IDENTIFY\n");
        let len = r.read_u32().await.unwrap();
        let mut body = vec![0u8; len as usize];
        r.read_exact(&mut body).await.unwrap();
        write_frame(&mut w, 0, b"OK").await;

        let sub = read_line(&mut r).await;
        write_frame(&mut w, 0, b"OK").await;
        (r, w, sub)
    }

    /// nsqlookupd answering a single `/lookup` with one producer on `nsqd_port`.
    async fn fake_lookupd(nsqd_port: u16) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (r, mut w) = socket.into_split();
            let mut r = BufReader::new(r);
            let request_line = read_line(&mut r).await;
            while !read_line(&mut r).await.trim_end().is_empty() {}

            let body = format!(
                r#"{{"channels":[],"producers":[{{"broadcast_address":"127.0.0.1","tcp_port":{nsqd_port}}}]}}"#
            );
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            w.write_all(response.as_bytes()).await.unwrap();
            request_line
        });
        (addr, handle)
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    fn test_config() -> Config {
        Config {
            max_in_flight: 10,
            drain_timeout: Duration::from_secs(2),
            ..Config::default()
        }
    }

    #[test]
    fn rejects_invalid_topic() {
        let err = Consumer::new("bad topic", "workers", Config::default()).unwrap_err();
        assert!(matches!(err, NsqError::InvalidName { kind: "topic", .. }));
    }

    #[test]
    fn second_handler_is_rejected() {
        let consumer = Consumer::new("orders", "workers", Config::default()).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        consumer.add_handler(Finisher { seen: seen.clone() }).unwrap();
        assert!(matches!(
            consumer.add_handler(Finisher { seen }),
            Err(NsqError::HandlerAlreadySet(_))
        ));
    }

    #[tokio::test]
    async fn connect_without_handler_fails() {
        let consumer = Consumer::new("orders", "workers", Config::default()).unwrap();
        let err = consumer.connect_to_nsqds(&["127.0.0.1:1".to_string()]).await.unwrap_err();
        assert!(matches!(err, NsqError::NoHandler(_)));
    }

    #[tokio::test]
    async fn stop_is_idempotent_without_connections() {
        let consumer = Consumer::new("orders", "workers", Config::default()).unwrap();
        consumer.stop();
        consumer.stop();
        tokio::time::timeout(Duration::from_secs(2), consumer.stopped()).await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }

    /// Fake nsqd: handshake, SUB, one message, expects FIN, then CLS.
    #[tokio::test]
    async fn consumes_finishes_and_stops() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (r, mut w) = socket.into_split();
            let mut r = BufReader::new(r);

            let mut magic = [0u8; 4];
            r.read_exact(&mut magic).await.unwrap();
            assert_eq!(&magic, b"  V2");

            let mut line = String::new();
            r.read_line(&mut line).await.unwrap();
            assert_eq!(line, "IDENTIFY\n");
            let len = r.read_u32().await.unwrap();
            let mut body = vec![0u8; len as usize];
            r.read_exact(&mut body).await.unwrap();
            write_frame(&mut w, 0, b"OK").await;

            line.clear();
            r.read_line(&mut line).await.unwrap();
            assert_eq!(line, "SUB orders workers\n");
            write_frame(&mut w, 0, b"OK").await;

            line.clear();
            r.read_line(&mut line).await.unwrap();
            assert_eq!(line, "RDY 10\n");

            write_frame(&mut w, 2, &message_data(b"000000000000000a", b"hello")).await;

            line.clear();
            r.read_line(&mut line).await.unwrap();
            assert_eq!(line, "FIN 000000000000000a\n");

            line.clear();
            r.read_line(&mut line).await.unwrap();
            assert_eq!(line, "CLS\n");
            write_frame(&mut w, 0, b"CLOSE_WAIT").await;
        });

        let consumer = Consumer::new("orders", "workers", test_config()).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        consumer.add_handler(Finisher { seen: seen.clone() }).unwrap();
        consumer.connect_to_nsqds(&[addr]).await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Running);
        assert_eq!(consumer.connection_count(), 1);

        tokio::time::timeout(Duration::from_secs(5), async {
            while seen.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // Give the FIN a moment to reach the socket before CLS is sent.
        tokio::time::sleep(Duration::from_millis(50)).await;
        consumer.stop();
        tokio::time::timeout(Duration::from_secs(5), consumer.stopped()).await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Stopped);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn broker_error_on_sub_fails_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (r, mut w) = socket.into_split();
            let mut r = BufReader::new(r);
            let mut magic = [0u8; 4];
            r.read_exact(&mut magic).await.unwrap();
            let mut line = String::new();
            r.read_line(&mut line).await.unwrap();
            let len = r.read_u32().await.unwrap();
            let mut body = vec![0u8; len as usize];
            r.read_exact(&mut body).await.unwrap();
            write_frame(&mut w, 0, b"OK").await;
            line.clear();
            r.read_line(&mut line).await.unwrap();
            write_frame(&mut w, 1, b"E_BAD_TOPIC").await;
        });

        let consumer = Consumer::new("orders", "workers", test_config()).unwrap();
        consumer.add_handler(Finisher { seen: Arc::new(AtomicUsize::new(0)) }).unwrap();
        let err = consumer.connect_to_nsqds(&[addr]).await.unwrap_err();
        assert!(matches!(err, NsqError::Broker(ref m) if m == "E_BAD_TOPIC"));
        consumer.stop();
    }

    #[tokio::test]
    async fn dropped_connection_returns_rdy_share() {
        let a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addrs = vec![a.local_addr().unwrap().to_string(), b.local_addr().unwrap().to_string()];

        let server_a = tokio::spawn(async move {
            let (mut r, mut w, _) = accept_subscriber(&a).await;
            let mut lines = Vec::new();
            loop {
                let line = read_line(&mut r).await;
                if line.is_empty() || line == "CLS\n" {
                    break;
                }
                lines.push(line.trim_end().to_string());
            }
            write_frame(&mut w, 0, b"CLOSE_WAIT").await;
            lines
        });
        // nsqd B goes away right after the handshake.
        let server_b = tokio::spawn(async move {
            let (mut r, _w, _) = accept_subscriber(&b).await;
            read_line(&mut r).await
        });

        let consumer = Consumer::new("orders", "workers", test_config()).unwrap();
        consumer.add_handler(Finisher { seen: Arc::new(AtomicUsize::new(0)) }).unwrap();
        consumer.connect_to_nsqds(&addrs).await.unwrap();
        assert_eq!(server_b.await.unwrap(), "RDY 5\n");

        wait_until(|| consumer.connection_count() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        consumer.stop();
        tokio::time::timeout(Duration::from_secs(5), consumer.stopped()).await.unwrap();

        assert_eq!(server_a.await.unwrap(), vec!["RDY 10", "RDY 5", "RDY 10"]);
    }

    #[tokio::test]
    async fn discovers_nsqd_through_lookupd() {
        let nsqd = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (lookupd, lookup_request) = fake_lookupd(nsqd.local_addr().unwrap().port()).await;

        let server = tokio::spawn(async move {
            let (mut r, mut w, sub) = accept_subscriber(&nsqd).await;
            assert_eq!(read_line(&mut r).await, "RDY 10\n");
            write_frame(&mut w, 2, &message_data(b"000000000000000b", b"hello")).await;
            let fin = read_line(&mut r).await;
            assert_eq!(read_line(&mut r).await, "CLS\n");
            write_frame(&mut w, 0, b"CLOSE_WAIT").await;
            (sub, fin)
        });

        let consumer = Consumer::new("orders", "workers", test_config()).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        consumer.add_handler(Finisher { seen: seen.clone() }).unwrap();
        consumer.connect_to_nsqlookupds(&[lookupd]).await.unwrap();

        let request = lookup_request.await.unwrap();
        assert!(request.starts_with("GET /lookup?topic=orders "), "{request}");
        assert_eq!(consumer.connection_count(), 1);
        assert_eq!(consumer.state(), ConsumerState::Running);

        wait_until(|| seen.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        consumer.stop();
        tokio::time::timeout(Duration::from_secs(5), consumer.stopped()).await.unwrap();

        let (sub, fin) = server.await.unwrap();
        assert_eq!(sub, "SUB orders workers\n");
        assert_eq!(fin, "FIN 000000000000000b\n");
    }
}

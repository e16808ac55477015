//! Relay connections and the shared pool.
//!
//! Each relay URL gets one persistent WebSocket connection, shared by every
//! in-flight subscription. A background task routes incoming frames to
//! per-subscription channels; on disconnect every open subscription is told
//! once and a reconnect is attempted after a short delay. Connections
//! optionally dial through a SOCKS5 proxy for .onion relays.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use futures_util::{
    future::{join_all, BoxFuture, Shared},
    stream::{SplitSink, SplitStream},
    FutureExt, SinkExt, StreamExt,
};
use rand::Rng;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::{mpsc, Mutex},
    time::{sleep, sleep_until, timeout, Instant},
};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async, tungstenite::Message, WebSocketStream};
use url::Url;

use crate::event::{Event, Filter};

/// Connection establishment deadline.
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(3500);
/// Hard deadline for a single subscription query.
pub const QUERY_TIMEOUT: Duration = Duration::from_millis(3500);
/// How long to keep collecting events after EOSE before closing.
pub const EOSE_GRACE: Duration = Duration::from_millis(300);
/// Pause before redialing a dropped connection.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Error)]
pub enum RelayError {
    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),
    #[error("failed to connect to {0}: {1}")]
    ConnectError(String, String),
    #[error("connection to {0} is not open")]
    NotOpen(String),
    #[error("query to {0} timed out")]
    QueryTimeout(String),
}

/// What a subscription hears from its relay.
#[derive(Debug)]
pub enum SubMessage {
    Event(Event),
    Eose,
    Closed,
    Disconnected,
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

type WsStream = WebSocketStream<Box<dyn AsyncReadWrite + Unpin + Send>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;
type OpenFuture = Shared<BoxFuture<'static, Result<(), RelayError>>>;

struct Inner {
    sink: Option<WsSink>,
    /// Bumped on every successful connect; a router task whose epoch is
    /// stale must not tear down a newer connection's state.
    epoch: u64,
    opening: Option<OpenFuture>,
    subs: HashMap<String, mpsc::UnboundedSender<SubMessage>>,
}

/// One long-lived connection to a relay.
pub struct RelayConnection {
    pub url: String,
    proxy: Option<String>,
    state: Arc<Mutex<Inner>>,
}

impl RelayConnection {
    pub fn new(url: String, proxy: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            url,
            proxy,
            state: Arc::new(Mutex::new(Inner {
                sink: None,
                epoch: 0,
                opening: None,
                subs: HashMap::new(),
            })),
        })
    }

    /// Make sure the socket is open, sharing one dial among concurrent
    /// callers so a relay is never connected to twice at once.
    pub async fn ensure_open(self: &Arc<Self>) -> Result<(), RelayError> {
        let fut = {
            let mut inner = self.state.lock().await;
            if inner.sink.is_some() {
                return Ok(());
            }
            if let Some(fut) = &inner.opening {
                fut.clone()
            } else {
                let this = self.clone();
                let fut: OpenFuture = async move { this.connect().await }.boxed().shared();
                inner.opening = Some(fut.clone());
                fut
            }
        };
        fut.await
    }

    async fn connect(self: Arc<Self>) -> Result<(), RelayError> {
        let dial = connect_ws(&self.url, self.proxy.as_deref());
        let result = match timeout(CONNECT_TIMEOUT, dial).await {
            Err(_) => Err(RelayError::ConnectTimeout(self.url.clone())),
            Ok(Err(e)) => Err(RelayError::ConnectError(self.url.clone(), e.to_string())),
            Ok(Ok(ws)) => {
                let (sink, source) = ws.split();
                let mut inner = self.state.lock().await;
                inner.sink = Some(sink);
                inner.epoch += 1;
                let epoch = inner.epoch;
                drop(inner);
                let this = self.clone();
                tokio::spawn(async move {
                    this.route_frames(source, epoch).await;
                });
                Ok(())
            }
        };
        self.state.lock().await.opening = None;
        result
    }

    /// Pump frames from the socket into subscription channels until the
    /// stream ends, then run the disconnect path.
    async fn route_frames(self: Arc<Self>, mut source: WsSource, epoch: u64) {
        while let Some(frame) = source.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(_) => continue,
                Err(_) => break,
            };
            let value: Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(_) => continue,
            };
            let Some(arr) = value.as_array() else { continue };
            let label = arr.first().and_then(Value::as_str).unwrap_or("");
            match label {
                "EVENT" => {
                    let (Some(sub_id), Some(raw)) =
                        (arr.get(1).and_then(Value::as_str), arr.get(2))
                    else {
                        continue;
                    };
                    let Ok(ev) = serde_json::from_value::<Event>(raw.clone()) else {
                        continue;
                    };
                    let inner = self.state.lock().await;
                    if let Some(tx) = inner.subs.get(sub_id) {
                        let _ = tx.send(SubMessage::Event(ev));
                    }
                }
                "EOSE" => {
                    let Some(sub_id) = arr.get(1).and_then(Value::as_str) else {
                        continue;
                    };
                    let inner = self.state.lock().await;
                    if let Some(tx) = inner.subs.get(sub_id) {
                        let _ = tx.send(SubMessage::Eose);
                    }
                }
                "CLOSED" => {
                    let Some(sub_id) = arr.get(1).and_then(Value::as_str) else {
                        continue;
                    };
                    // The relay will send nothing further for this
                    // subscription, so drop it entirely.
                    let mut inner = self.state.lock().await;
                    if let Some(tx) = inner.subs.remove(sub_id) {
                        let _ = tx.send(SubMessage::Closed);
                    }
                }
                // NOTICE, OK, AUTH and anything unknown are ignored.
                _ => {}
            }
        }
        self.handle_close(epoch).await;
    }

    async fn handle_close(self: Arc<Self>, epoch: u64) {
        {
            let mut inner = self.state.lock().await;
            if inner.epoch != epoch {
                return;
            }
            inner.sink = None;
            for (_, tx) in inner.subs.drain() {
                let _ = tx.send(SubMessage::Disconnected);
            }
        }
        eprintln!("[relay] lost connection to {}, redialing", self.url);
        tokio::spawn(self.redial());
    }

    /// Boxed: the redial future re-enters `ensure_open`, which transitively
    /// spawns this close path, so the type must not embed itself.
    fn redial(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move {
            sleep(RECONNECT_DELAY).await;
            if let Err(e) = self.ensure_open().await {
                eprintln!("[relay] reconnect to {} failed: {e}", self.url);
            }
        }
        .boxed()
    }

    /// Open a subscription and send its REQ. The channel is registered
    /// before the REQ goes out so no frame can race past the router.
    pub async fn request(
        self: &Arc<Self>,
        sub_id: &str,
        filter: &Filter,
    ) -> Result<mpsc::UnboundedReceiver<SubMessage>, RelayError> {
        self.ensure_open().await?;
        let frame = json!(["REQ", sub_id, filter]).to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.state.lock().await;
        inner.subs.insert(sub_id.to_string(), tx);
        let sink = match inner.sink.as_mut() {
            Some(sink) => sink,
            None => {
                inner.subs.remove(sub_id);
                return Err(RelayError::NotOpen(self.url.clone()));
            }
        };
        if sink.send(Message::Text(frame)).await.is_err() {
            inner.subs.remove(sub_id);
            return Err(RelayError::NotOpen(self.url.clone()));
        }
        Ok(rx)
    }

    /// Tell the relay we are done with a subscription. Best effort.
    pub async fn close_sub(self: &Arc<Self>, sub_id: &str) {
        let mut inner = self.state.lock().await;
        inner.subs.remove(sub_id);
        if let Some(sink) = inner.sink.as_mut() {
            let frame = json!(["CLOSE", sub_id]).to_string();
            let _ = sink.send(Message::Text(frame)).await;
        }
    }
}

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
async fn connect_ws(relay: &str, tor_socks: Option<&str>) -> Result<WsStream> {
    let url = Url::parse(relay)?;
    let host = url.host_str().ok_or_else(|| anyhow!("missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("missing port"))?;
    let req = relay.into_client_request()?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
        Box::new(Socks5Stream::connect(proxy, (host, port)).await?)
    } else {
        Box::new(TcpStream::connect((host, port)).await?)
    };
    let (ws, _) = client_async(req, stream).await?;
    Ok(ws)
}

/// Shared set of relay connections, one per URL.
pub struct RelayPool {
    proxy: Option<String>,
    relays: Mutex<HashMap<String, Arc<RelayConnection>>>,
}

impl RelayPool {
    pub fn new(proxy: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            proxy,
            relays: Mutex::new(HashMap::new()),
        })
    }

    /// Get or create the connection handle for a relay URL.
    pub async fn relay(&self, url: &str) -> Option<Arc<RelayConnection>> {
        let url = url.trim();
        if url.is_empty() {
            return None;
        }
        let mut relays = self.relays.lock().await;
        Some(
            relays
                .entry(url.to_string())
                .or_insert_with(|| RelayConnection::new(url.to_string(), self.proxy.clone()))
                .clone(),
        )
    }

    /// Run one filter against every given relay concurrently and merge the
    /// results, deduplicating by event id. A relay that fails or times out
    /// contributes nothing; the merged result still covers the rest.
    pub async fn query_events(&self, urls: &[String], filter: &Filter) -> Vec<Event> {
        let mut conns = vec![];
        for url in urls {
            if let Some(conn) = self.relay(url).await {
                conns.push(conn);
            }
        }
        let queries = conns.iter().map(|conn| query_one(conn.clone(), filter));
        let mut merged: HashMap<String, Event> = HashMap::new();
        for events in join_all(queries).await {
            for ev in events {
                merged.entry(ev.id.clone()).or_insert(ev);
            }
        }
        merged.into_values().collect()
    }
}

/// One subscription lifecycle: REQ, collect until EOSE plus a grace window
/// (or the hard deadline), CLOSE. Errors degrade to an empty result.
async fn query_one(conn: Arc<RelayConnection>, filter: &Filter) -> Vec<Event> {
    let sub_id = make_sub_id();
    let mut rx = match conn.request(&sub_id, filter).await {
        Ok(rx) => rx,
        Err(e) => {
            eprintln!("[relay] query to {} failed: {e}", conn.url);
            return vec![];
        }
    };
    let hard_deadline = Instant::now() + QUERY_TIMEOUT;
    let mut grace: Option<Instant> = None;
    let mut events = vec![];
    loop {
        let deadline = match grace {
            Some(g) if g < hard_deadline => g,
            _ => hard_deadline,
        };
        tokio::select! {
            _ = sleep_until(deadline) => break,
            msg = rx.recv() => match msg {
                Some(SubMessage::Event(ev)) => events.push(ev),
                Some(SubMessage::Eose) => {
                    if grace.is_none() {
                        grace = Some(Instant::now() + EOSE_GRACE);
                    }
                }
                Some(SubMessage::Closed) | Some(SubMessage::Disconnected) | None => break,
            },
        }
    }
    conn.close_sub(&sub_id).await;
    events
}

fn make_sub_id() -> String {
    let n: u64 = rand::thread_rng().gen();
    format!("srv-{n:016x}")
}

//! WebSocket connection to a single relay, multiplexing subscriptions.
//!
//! One reader task parses relay messages and routes `EVENT`/`EOSE`/`CLOSED`
//! to the subscription that owns the id; one writer task drains an unbounded
//! queue of outgoing frames. When the socket ends every route is dropped, so
//! every subscription stream on the connection ends with it.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::anyhow;
use dashmap::DashMap;
use futures_util::{stream::SplitStream, SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async_tls, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::{ChatError, Result},
    event::Event,
    filter::Filter,
};

/// How relay connections are established.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Optional SOCKS5 proxy (host:port) used for every relay.
    pub tor_socks: Option<String>,
    /// Upper bound on TCP, TLS and websocket handshakes together.
    pub connect_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            tor_socks: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Message sent by a relay to the client (NIP-01).
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// `["EVENT", subscription_id, event]`
    Event {
        subscription_id: String,
        event: Event,
    },
    /// `["EOSE", subscription_id]`
    Eose(String),
    /// `["CLOSED", subscription_id, reason]`
    Closed {
        subscription_id: String,
        reason: String,
    },
    /// `["NOTICE", message]`
    Notice(String),
    /// `["OK", event_id, accepted, message]`
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
}

impl RelayMessage {
    /// Parse a text frame. Unknown or malformed messages yield `None`.
    pub fn parse(txt: &str) -> Option<Self> {
        let val: Value = serde_json::from_str(txt).ok()?;
        let arr = val.as_array()?;
        let text = |i: usize| arr.get(i).and_then(|v| v.as_str()).map(str::to_string);
        match arr.first()?.as_str()? {
            "EVENT" if arr.len() >= 3 => {
                let event = serde_json::from_value(arr[2].clone()).ok()?;
                Some(Self::Event {
                    subscription_id: text(1)?,
                    event,
                })
            }
            "EOSE" => Some(Self::Eose(text(1)?)),
            "CLOSED" => Some(Self::Closed {
                subscription_id: text(1)?,
                reason: text(2).unwrap_or_default(),
            }),
            "NOTICE" => Some(Self::Notice(text(1).unwrap_or_default())),
            "OK" => Some(Self::Ok {
                event_id: text(1)?,
                accepted: arr.get(2).and_then(Value::as_bool).unwrap_or(false),
                message: text(3).unwrap_or_default(),
            }),
            _ => None,
        }
    }
}

/// What a subscription receives from its connection.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionItem {
    Event(Event),
    EndOfStoredEvents,
    /// The relay closed the subscription with the given reason.
    Closed(String),
}

/// How long shutdown waits for the writer and for the relay's close reply.
const CLOSE_WAIT: Duration = Duration::from_secs(2);

type Routes = Arc<DashMap<String, mpsc::UnboundedSender<SubscriptionItem>>>;
type BoxedStream = Box<dyn AsyncReadWrite + Unpin + Send>;
type WsStream = WebSocketStream<MaybeTlsStream<BoxedStream>>;

/// Live connection to one relay.
pub struct RelayConnection {
    url: String,
    outgoing: mpsc::UnboundedSender<Message>,
    routes: Routes,
    next_id: AtomicU64,
    /// Set once `close` has run.
    closed: AtomicBool,
    /// Cleared by the reader when the socket ends.
    alive: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl RelayConnection {
    /// Connect to `url`, optionally through a SOCKS5 proxy.
    pub async fn connect(url: &str, options: &ConnectOptions) -> Result<Arc<Self>> {
        let failed = |reason: String| ChatError::Connection {
            url: url.to_string(),
            reason,
        };
        let ws = match timeout(
            options.connect_timeout,
            connect_ws(url, options.tor_socks.as_deref()),
        )
        .await
        {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => return Err(failed(e.to_string())),
            Err(_) => {
                return Err(failed(format!(
                    "timed out after {}s",
                    options.connect_timeout.as_secs()
                )))
            }
        };

        let (mut sink, stream) = ws.split();
        let (outgoing, mut queue) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(msg) = queue.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    debug!(error = %e, "relay write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let routes: Routes = Arc::new(DashMap::new());
        let alive = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_loop(
            url.to_string(),
            stream,
            routes.clone(),
            alive.clone(),
        ));
        info!(relay = %url, "connected");

        Ok(Arc::new(Self {
            url: url.to_string(),
            outgoing,
            routes,
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            alive,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
        }))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// True once closed locally or after the relay dropped the socket.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || !self.alive.load(Ordering::SeqCst)
    }

    /// Allocate a subscription id derived from `label` and start routing its
    /// messages. Nothing is sent to the relay yet.
    pub(crate) fn register(
        &self,
        label: &str,
    ) -> Result<(String, mpsc::UnboundedReceiver<SubscriptionItem>)> {
        if self.is_closed() {
            return Err(ChatError::Closed(self.url.clone()));
        }
        let id = subscription_id(label, self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.insert(id.clone(), tx);
        Ok((id, rx))
    }

    /// Send `["REQ", id, filters...]`.
    pub(crate) fn send_req(&self, id: &str, filters: &[Filter]) -> Result<()> {
        let mut msg = vec![Value::String("REQ".into()), Value::String(id.into())];
        msg.extend(filters.iter().map(|f| Value::Object(f.to_json())));
        self.send(Value::Array(msg))
    }

    /// Stop routing `id` and tell the relay to drop it.
    pub(crate) fn unsubscribe(&self, id: &str) {
        if self.routes.remove(id).is_some() && !self.is_closed() {
            let _ = self.send(json!(["CLOSE", id]));
        }
    }

    /// Publish a signed event.
    pub fn publish(&self, event: &Event) -> Result<()> {
        self.send(json!(["EVENT", event]))
    }

    /// One-shot request: collect stored events until `EOSE`, a `CLOSED`, the
    /// end of the socket or `wait` elapsing, whichever comes first.
    pub async fn query(&self, filters: &[Filter], wait: Duration) -> Result<Vec<Event>> {
        let (id, mut rx) = self.register("query")?;
        if let Err(e) = self.send_req(&id, filters) {
            self.routes.remove(&id);
            return Err(e);
        }
        let mut events = Vec::new();
        let collect = async {
            while let Some(item) = rx.recv().await {
                match item {
                    SubscriptionItem::Event(ev) => events.push(ev),
                    SubscriptionItem::EndOfStoredEvents | SubscriptionItem::Closed(_) => break,
                }
            }
        };
        if timeout(wait, collect).await.is_err() {
            debug!(relay = %self.url, "query timed out");
        }
        self.unsubscribe(&id);
        Ok(events)
    }

    /// Close the socket and end every subscription stream. Returns `true`
    /// only for the call that actually closed the connection.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.outgoing.send(Message::Close(None));
        self.routes.clear();
        info!(relay = %self.url, "connection closed");
        true
    }

    /// Close like [`close`](Self::close), then wait briefly until queued
    /// frames have been written and the relay has answered the close.
    pub async fn shutdown(&self) -> bool {
        let closed = self.close();
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if timeout(CLOSE_WAIT, writer).await.is_err() {
                debug!(relay = %self.url, "writer did not finish in time");
            }
        }
        let reader = self.reader.lock().take();
        if let Some(mut reader) = reader {
            if timeout(CLOSE_WAIT, &mut reader).await.is_err() {
                debug!(relay = %self.url, "relay did not answer close");
                reader.abort();
            }
        }
        closed
    }

    fn send(&self, msg: Value) -> Result<()> {
        if self.is_closed() {
            return Err(ChatError::Closed(self.url.clone()));
        }
        self.outgoing
            .send(Message::Text(msg.to_string()))
            .map_err(|_| ChatError::Closed(self.url.clone()))
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        self.close();
        // The reader drains until the relay answers; stop it if it never does.
        if let Some(mut reader) = self.reader.get_mut().take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if timeout(CLOSE_WAIT, &mut reader).await.is_err() {
                            reader.abort();
                        }
                    });
                }
                Err(_) => reader.abort(),
            }
        }
    }
}

/// Parse incoming frames and route them by subscription id.
async fn read_loop(
    url: String,
    mut stream: SplitStream<WsStream>,
    routes: Routes,
    alive: Arc<AtomicBool>,
) {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(txt)) => match RelayMessage::parse(&txt) {
                Some(RelayMessage::Event {
                    subscription_id,
                    event,
                }) => route(&routes, &subscription_id, SubscriptionItem::Event(event)),
                Some(RelayMessage::Eose(subscription_id)) => {
                    route(&routes, &subscription_id, SubscriptionItem::EndOfStoredEvents)
                }
                Some(RelayMessage::Closed {
                    subscription_id,
                    reason,
                }) => {
                    if let Some((_, tx)) = routes.remove(&subscription_id) {
                        let _ = tx.send(SubscriptionItem::Closed(reason));
                    }
                }
                Some(RelayMessage::Notice(notice)) => info!(relay = %url, %notice, "relay notice"),
                Some(RelayMessage::Ok {
                    event_id,
                    accepted,
                    message,
                }) => {
                    if accepted {
                        debug!(relay = %url, %event_id, "event accepted");
                    } else {
                        warn!(relay = %url, %event_id, %message, "event rejected");
                    }
                }
                None => debug!(relay = %url, "ignoring unrecognised message"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(relay = %url, error = %e, "relay read failed");
                break;
            }
        }
    }
    alive.store(false, Ordering::SeqCst);
    routes.clear();
    debug!(relay = %url, "reader stopped");
}

fn route(routes: &Routes, id: &str, item: SubscriptionItem) {
    match routes.get(id) {
        Some(tx) => {
            let _ = tx.send(item);
        }
        None => debug!(subscription = %id, "message for unknown subscription"),
    }
}

/// Sanitise `label` into a subscription id unique on this connection.
fn subscription_id(label: &str, n: u64) -> String {
    let mut id: String = label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    id.truncate(40);
    format!("{id}-{n}")
}

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
async fn connect_ws(relay: &str, tor_socks: Option<&str>) -> anyhow::Result<WsStream> {
    let url = Url::parse(relay)?;
    if url.scheme() != "ws" && url.scheme() != "wss" {
        return Err(anyhow!("unsupported scheme: {}", url.scheme()));
    }
    let host = url.host_str().ok_or_else(|| anyhow!("missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("missing port"))?;
    let req = relay.into_client_request()?;
    let stream: BoxedStream = if let Some(proxy) = tor_socks {
        Box::new(Socks5Stream::connect(proxy, (host, port)).await?)
    } else {
        Box::new(TcpStream::connect((host, port)).await?)
    };
    let (ws, _) = client_async_tls(req, stream).await?;
    Ok(ws)
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

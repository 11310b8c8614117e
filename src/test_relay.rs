//! In-process relay used by unit tests.
//!
//! Answers `REQ` with stored events matching the filters followed by `EOSE`,
//! forwards events pushed later to matching live subscriptions, and counts
//! connections, `CLOSE` requests and close frames.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::broadcast, task::JoinHandle};
use tokio_tungstenite::{accept_async, tungstenite::Message};

use crate::{
    event::{Event, Tag},
    filter::Filter,
};

#[derive(Default)]
struct State {
    connections: AtomicUsize,
    closes: AtomicUsize,
    closed_subscriptions: AtomicUsize,
    stored: Mutex<Vec<Event>>,
    requests: Mutex<Vec<Value>>,
    published: Mutex<Vec<Event>>,
    rejected_groups: Mutex<Vec<String>>,
}

pub(crate) struct FakeRelay {
    pub url: String,
    state: Arc<State>,
    live: broadcast::Sender<Event>,
    task: JoinHandle<()>,
}

impl FakeRelay {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let state = Arc::new(State::default());
        let (live, _) = broadcast::channel(1024);
        let accept_state = state.clone();
        let accept_live = live.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = accept_state.clone();
                let live = accept_live.subscribe();
                tokio::spawn(async move {
                    if let Ok(ws) = accept_async(stream).await {
                        serve(ws, state, live).await;
                    }
                });
            }
        });
        Self {
            url,
            state,
            live,
            task,
        }
    }

    /// Keep `ev` for future `REQ`s.
    pub fn store(&self, ev: Event) {
        self.state.stored.lock().push(ev);
    }

    /// Deliver `ev` to matching live subscriptions and keep it.
    pub fn push(&self, ev: Event) {
        self.store(ev.clone());
        let _ = self.live.send(ev);
    }

    /// Answer `REQ`s carrying a `#g`/`#d` value of `group` with `CLOSED`.
    pub fn reject_group(&self, group: &str) {
        self.state.rejected_groups.lock().push(group.to_string());
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn closed_subscriptions(&self) -> usize {
        self.state.closed_subscriptions.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Value> {
        self.state.requests.lock().clone()
    }

    pub fn published(&self) -> Vec<Event> {
        self.state.published.lock().clone()
    }

    /// Poll until `cond` holds, panicking after five seconds.
    pub async fn wait_for(&self, cond: impl Fn(&Self) -> bool) {
        for _ in 0..500 {
            if cond(self) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached on {}", self.url);
    }
}

impl Drop for FakeRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    state: Arc<State>,
    mut live: broadcast::Receiver<Event>,
) {
    state.connections.fetch_add(1, Ordering::SeqCst);
    let (mut sink, mut source) = ws.split();
    let mut subs: HashMap<String, Vec<Filter>> = HashMap::new();
    loop {
        tokio::select! {
            msg = source.next() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(txt) => {
                        let Ok(val) = serde_json::from_str::<Value>(&txt) else { continue };
                        let Some(arr) = val.as_array() else { continue };
                        match arr.first().and_then(Value::as_str) {
                            Some("REQ") if arr.len() >= 2 => {
                                state.requests.lock().push(val.clone());
                                let id = arr[1].as_str().unwrap_or_default().to_string();
                                let filters: Vec<Filter> = arr[2..].iter().map(parse_filter).collect();
                                if rejected(&state, &filters) {
                                    let msg = json!(["CLOSED", id, "blocked: group rejected"]);
                                    let _ = sink.send(Message::Text(msg.to_string())).await;
                                    continue;
                                }
                                let stored: Vec<Event> = state
                                    .stored
                                    .lock()
                                    .iter()
                                    .filter(|ev| filters.iter().any(|f| f.matches(ev)))
                                    .cloned()
                                    .collect();
                                for ev in stored {
                                    let msg = json!(["EVENT", id, ev]);
                                    let _ = sink.send(Message::Text(msg.to_string())).await;
                                }
                                let _ = sink.send(Message::Text(json!(["EOSE", id]).to_string())).await;
                                subs.insert(id, filters);
                            }
                            Some("CLOSE") => {
                                if let Some(id) = arr.get(1).and_then(Value::as_str) {
                                    subs.remove(id);
                                }
                                state.closed_subscriptions.fetch_add(1, Ordering::SeqCst);
                            }
                            Some("EVENT") if arr.len() >= 2 => {
                                if let Ok(ev) = serde_json::from_value::<Event>(arr[1].clone()) {
                                    let ok = json!(["OK", ev.id, true, ""]);
                                    let _ = sink.send(Message::Text(ok.to_string())).await;
                                    state.published.lock().push(ev);
                                }
                            }
                            _ => {}
                        }
                    }
                    Message::Close(_) => {
                        state.closes.fetch_add(1, Ordering::SeqCst);
                        break;
                    }
                    _ => {}
                }
            }
            ev = live.recv() => {
                let ev = match ev {
                    Ok(ev) => ev,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                for (id, filters) in &subs {
                    if filters.iter().any(|f| f.matches(&ev)) {
                        let msg = json!(["EVENT", id, ev]);
                        let _ = sink.send(Message::Text(msg.to_string())).await;
                    }
                }
            }
        }
    }
}

fn rejected(state: &State, filters: &[Filter]) -> bool {
    let rejected = state.rejected_groups.lock();
    filters.iter().any(|f| {
        f.tags
            .values()
            .flatten()
            .any(|v| rejected.iter().any(|r| r == v))
    })
}

/// Read the wire form of a filter back into a `Filter`.
fn parse_filter(val: &Value) -> Filter {
    let strings = |v: &Value| -> Vec<String> {
        v.as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|s| s.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    };
    let mut filter = Filter::new();
    if let Some(obj) = val.as_object() {
        for (key, v) in obj {
            match key.as_str() {
                "authors" => filter.authors = Some(strings(v)),
                "kinds" => {
                    filter.kinds = v.as_array().map(|arr| {
                        arr.iter()
                            .filter_map(|k| k.as_u64().map(|k| k as u32))
                            .collect()
                    })
                }
                "since" => filter.since = v.as_u64(),
                "until" => filter.until = v.as_u64(),
                "limit" => filter.limit = v.as_u64().map(|l| l as u32),
                tag if tag.starts_with('#') => {
                    filter.tags.insert(tag[1..].to_string(), strings(v));
                }
                _ => {}
            }
        }
    }
    filter
}

/// Unsigned event with the given identity fields.
pub(crate) fn sample_event(id: &str, pubkey: &str, kind: u32, created_at: u64) -> Event {
    Event {
        id: id.into(),
        pubkey: pubkey.into(),
        kind,
        created_at,
        tags: vec![],
        content: String::new(),
        sig: String::new(),
    }
}

/// Chat message for `group`.
pub(crate) fn chat_event(id: &str, pubkey: &str, group: &str, created_at: u64) -> Event {
    let mut ev = sample_event(id, pubkey, crate::event::KIND_CHAT, created_at);
    ev.tags.push(Tag::new("g", group));
    ev.content = format!("message {id}");
    ev
}

//! Authoritative set of relays, their groups and the ingestion tasks feeding
//! each group ledger.
//!
//! Structural changes (adding or removing relays and groups) are serialised
//! by one async lock; everything else is read through concurrent maps. The
//! menu projection is rebuilt in full and swapped, so readers only ever see a
//! complete snapshot.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    connection::{ConnectOptions, RelayConnection},
    error::{ChatError, Result},
    event::{verify_event, Event, EventTemplate, Keys, KIND_METADATA},
    filter::Filter,
    ledger::{GroupLedger, LedgerChange},
    people::{MetadataSource, MetadataUpdate, PersonMetadataCache},
    prefs::{self, RelayRecord},
    subscription::{group_filters, CloseReason, Subscription},
};

/// Group every relay starts with.
pub const ROOT_GROUP: &str = "/";

/// Signals for the presentation layer. Delivery is best effort.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// The menu projection was rebuilt.
    MenuChanged,
    /// Messages of a group, or the names shown next to them, changed.
    GroupMessagesChanged { relay_url: String, group_id: String },
    /// A failure the user should see.
    Error { message: String },
}

/// One row of the menu projection.
#[derive(Debug, Clone, PartialEq)]
pub struct MenuItem {
    pub relay_url: String,
    /// Root rows stand for the relay itself and precede its groups.
    pub is_root: bool,
    pub group_id: String,
    pub group_name: String,
    pub group_icon: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub connect: ConnectOptions,
    /// Where relays and identity are persisted; `None` keeps everything in memory.
    pub state_root: Option<PathBuf>,
    /// Drop events whose id or signature does not verify.
    pub verify_sig: bool,
    /// How long a metadata lookup waits on each relay.
    pub metadata_timeout: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            connect: ConnectOptions::default(),
            state_root: None,
            verify_sig: false,
            metadata_timeout: Duration::from_secs(5),
        }
    }
}

/// Ingestion task of one group and the token that stops it.
struct SubscriptionHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct GroupEntry {
    seq: u64,
    ledger: Arc<RwLock<GroupLedger>>,
    subscription: SubscriptionHandle,
}

/// A connected relay and the groups joined on it.
struct ChatRelay {
    seq: u64,
    connection: Arc<RelayConnection>,
    groups: DashMap<String, GroupEntry>,
    next_group: AtomicU64,
}

impl ChatRelay {
    fn new(seq: u64, connection: Arc<RelayConnection>) -> Self {
        Self {
            seq,
            connection,
            groups: DashMap::new(),
            next_group: AtomicU64::new(0),
        }
    }

    /// Group ids in the order they were added.
    fn group_ids(&self) -> Vec<String> {
        let mut ids: Vec<(u64, String)> = self
            .groups
            .iter()
            .map(|g| (g.seq, g.key().clone()))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    fn ledger(&self, url: &str, group_id: &str) -> Result<Arc<RwLock<GroupLedger>>> {
        self.groups
            .get(group_id)
            .map(|g| g.ledger.clone())
            .ok_or_else(|| ChatError::GroupNotFound {
                url: url.to_string(),
                group: group_id.to_string(),
            })
    }

    /// Stop every ingestion task, wait until none can touch a ledger again,
    /// then close the connection. Returns whether this call closed it.
    async fn teardown(&self) -> bool {
        let ids: Vec<String> = self.groups.iter().map(|g| g.key().clone()).collect();
        let entries: Vec<GroupEntry> = ids
            .iter()
            .filter_map(|id| self.groups.remove(id).map(|(_, entry)| entry))
            .collect();
        for entry in &entries {
            entry.subscription.cancel.cancel();
        }
        join_all(entries.into_iter().map(|e| e.subscription.task)).await;
        self.connection.shutdown().await
    }
}

/// Registry of relays, groups and subscriptions shared with the presentation
/// layer.
pub struct RelayRegistry {
    relays: DashMap<String, Arc<ChatRelay>>,
    next_relay: AtomicU64,
    structure: tokio::sync::Mutex<()>,
    menu: RwLock<Arc<Vec<MenuItem>>>,
    menu_rebuild: Mutex<()>,
    people: Arc<PersonMetadataCache>,
    notices: broadcast::Sender<Notification>,
    selected: RwLock<Option<(String, String)>>,
    keys: RwLock<Option<Keys>>,
    options: RegistryOptions,
}

impl RelayRegistry {
    /// Registry resolving author metadata from its own relays.
    pub fn new(options: RegistryOptions) -> Arc<Self> {
        let wait = options.metadata_timeout;
        Arc::new_cyclic(|registry| {
            let source = Arc::new(RelayMetadataSource {
                registry: registry.clone(),
                wait,
            });
            Self::build(options, source)
        })
    }

    /// Registry resolving author metadata from `source`.
    #[cfg(test)]
    pub fn with_metadata_source(
        options: RegistryOptions,
        source: Arc<dyn MetadataSource>,
    ) -> Arc<Self> {
        Arc::new(Self::build(options, source))
    }

    fn build(options: RegistryOptions, source: Arc<dyn MetadataSource>) -> Self {
        let (notices, _) = broadcast::channel(256);
        Self {
            relays: DashMap::new(),
            next_relay: AtomicU64::new(0),
            structure: tokio::sync::Mutex::new(()),
            menu: RwLock::new(Arc::new(Vec::new())),
            menu_rebuild: Mutex::new(()),
            people: PersonMetadataCache::new(source),
            notices,
            selected: RwLock::new(None),
            keys: RwLock::new(None),
            options,
        }
    }

    /// Receive notifications from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notices.subscribe()
    }

    /// Connect to `url` and register it. Adding a known relay does nothing.
    /// Returns the normalised URL.
    pub async fn add_relay(&self, url: &str) -> Result<String> {
        let url = normalize_relay_url(url);
        let guard = self.structure.lock().await;
        if self.relays.contains_key(&url) {
            debug!(relay = %url, "relay already present");
            return Ok(url);
        }
        let connection = match RelayConnection::connect(&url, &self.options.connect).await {
            Ok(connection) => connection,
            Err(e) => {
                self.report(&e);
                return Err(e);
            }
        };
        let seq = self.next_relay.fetch_add(1, Ordering::Relaxed);
        self.relays
            .insert(url.clone(), Arc::new(ChatRelay::new(seq, connection)));
        drop(guard);
        info!(relay = %url, "relay added");
        self.rebuild_menu();
        Ok(url)
    }

    /// Join `group_id` on a known relay and persist the result. Joining a
    /// group twice does nothing. When persisting fails the group stays
    /// joined and the `Persist` error is returned.
    pub async fn add_group(self: &Arc<Self>, relay_url: &str, group_id: &str) -> Result<()> {
        self.join_group(relay_url, group_id, true).await
    }

    async fn join_group(self: &Arc<Self>, relay_url: &str, group_id: &str, persist: bool) -> Result<()> {
        let url = normalize_relay_url(relay_url);
        let group = normalize_group_id(group_id);
        let guard = self.structure.lock().await;
        let relay = self.relay(&url)?;
        if relay.groups.contains_key(&group) {
            debug!(relay = %url, group = %group, "group already present");
            return Ok(());
        }

        let created = Subscription::create(
            relay.connection.clone(),
            &format!("chat{group}"),
            group_filters(&group),
        );
        let subscription = match created {
            Ok(subscription) => subscription,
            Err(e) => {
                let e = ChatError::Subscription {
                    url,
                    group,
                    reason: e.to_string(),
                };
                self.report(&e);
                return Err(e);
            }
        };
        self.activate(&relay, &url, &group, subscription)?;
        let persisted = if persist {
            self.persist_relay(&url, &relay)
        } else {
            Ok(())
        };
        if let Err(e) = &persisted {
            self.report(e);
        }
        drop(guard);
        self.rebuild_menu();
        persisted
    }

    /// Fire `subscription` and start feeding a fresh ledger from it. A failed
    /// fire is reported and leaves the relay and its other groups alone.
    fn activate(
        self: &Arc<Self>,
        relay: &ChatRelay,
        url: &str,
        group: &str,
        mut subscription: Subscription,
    ) -> Result<()> {
        if let Err(e) = subscription.fire() {
            self.report(&e);
            return Err(e);
        }
        let subscription_id = subscription.id().to_string();
        let ledger = Arc::new(RwLock::new(GroupLedger::new(group)));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(ingest(
            Arc::downgrade(self),
            url.to_string(),
            group.to_string(),
            subscription,
            ledger.clone(),
            cancel.clone(),
        ));
        let seq = relay.next_group.fetch_add(1, Ordering::Relaxed);
        relay.groups.insert(
            group.to_string(),
            GroupEntry {
                seq,
                ledger,
                subscription: SubscriptionHandle { cancel, task },
            },
        );
        info!(relay = %url, group = %group, subscription = %subscription_id, "group added");
        Ok(())
    }

    /// Bring back a persisted relay and its groups without rewriting the
    /// stored configuration.
    pub async fn restore(self: &Arc<Self>, record: &RelayRecord) -> Result<()> {
        let url = self.add_relay(&record.url).await?;
        for group in &record.groups {
            if let Err(e) = self.join_group(&url, group, false).await {
                warn!(relay = %url, group = %group, error = %e, "skipping persisted group");
            }
        }
        Ok(())
    }

    /// Replay every persisted relay and load the persisted identity unless
    /// one is already set. Relays that fail are skipped. Returns how many
    /// relays were restored.
    pub async fn load_persisted(self: &Arc<Self>) -> Result<usize> {
        let Some(root) = self.options.state_root.clone() else {
            return Ok(0);
        };
        if self.keys.read().is_none() {
            if let Some(secret) = prefs::load_identity(&root).map_err(persist_error)? {
                match Keys::from_hex(&secret) {
                    Ok(keys) => self.set_identity(Some(keys)),
                    Err(e) => warn!(error = %e, "ignoring unreadable identity"),
                }
            }
        }
        let records = prefs::load_relays(&root).map_err(persist_error)?;
        let mut restored = 0;
        for record in records.iter().filter(|r| !r.url.trim().is_empty()) {
            match self.restore(record).await {
                Ok(()) => restored += 1,
                Err(e) => warn!(relay = %record.url, error = %e, "skipping persisted relay"),
            }
        }
        Ok(restored)
    }

    /// Disconnect one relay if it is live, forget its groups and drop it
    /// from the persisted configuration. Fails with `RelayNotFound` when the
    /// relay is neither live nor persisted.
    pub async fn remove_relay(&self, url: &str) -> Result<()> {
        let url = normalize_relay_url(url);
        let guard = self.structure.lock().await;
        let live = self.relays.remove(&url).map(|(_, relay)| relay);
        if let Some(relay) = &live {
            relay.teardown().await;
            self.clear_selection_on(&url);
        }
        let forgotten = self.forget_persisted(&url);
        drop(guard);
        if live.is_none() && matches!(forgotten, Ok(false)) {
            return Err(ChatError::RelayNotFound(url));
        }
        info!(relay = %url, "relay removed");
        self.rebuild_menu();
        forgotten.map(|_| ())
    }

    /// Close every relay and clear all state, including the persisted relay
    /// list and identity.
    pub async fn remove_all_relays(&self) -> Result<()> {
        let guard = self.structure.lock().await;
        let closed = self.teardown_all().await;
        *self.selected.write() = None;
        *self.keys.write() = None;
        let cleared = match &self.options.state_root {
            Some(root) => prefs::clear(root).map_err(persist_error),
            None => Ok(()),
        };
        drop(guard);
        info!(closed, "all relays removed");
        self.rebuild_menu();
        cleared
    }

    /// Close every relay, leaving persisted state alone.
    pub async fn shutdown(&self) {
        let guard = self.structure.lock().await;
        let closed = self.teardown_all().await;
        drop(guard);
        debug!(closed, "registry shut down");
        self.rebuild_menu();
    }

    async fn teardown_all(&self) -> usize {
        let relays: Vec<Arc<ChatRelay>> = self.relays.iter().map(|r| r.value().clone()).collect();
        self.relays.clear();
        join_all(relays.iter().map(|r| r.teardown()))
            .await
            .into_iter()
            .filter(|closed| *closed)
            .count()
    }

    /// Recompute the menu from the current relays and groups and swap it in.
    pub fn rebuild_menu(&self) {
        let _rebuilding = self.menu_rebuild.lock();
        let mut relays: Vec<(String, Arc<ChatRelay>)> = self
            .relays
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        relays.sort_by_key(|(_, r)| r.seq);

        let mut items = Vec::new();
        for (url, relay) in relays {
            items.push(MenuItem {
                relay_url: url.clone(),
                is_root: true,
                group_id: ROOT_GROUP.to_string(),
                group_name: String::new(),
                group_icon: None,
            });
            let mut groups: Vec<(u64, Arc<RwLock<GroupLedger>>)> = relay
                .groups
                .iter()
                .map(|g| (g.seq, g.ledger.clone()))
                .collect();
            groups.sort_by_key(|(seq, _)| *seq);
            for (_, ledger) in groups {
                let ledger = ledger.read();
                items.push(MenuItem {
                    relay_url: url.clone(),
                    is_root: false,
                    group_id: ledger.id().to_string(),
                    group_name: ledger.name().to_string(),
                    group_icon: ledger.picture().map(str::to_string),
                });
            }
        }
        *self.menu.write() = Arc::new(items);
        self.notify(Notification::MenuChanged);
    }

    /// Current menu snapshot.
    pub fn menu(&self) -> Arc<Vec<MenuItem>> {
        self.menu.read().clone()
    }

    /// Relay URLs in the order they were added.
    pub fn relay_urls(&self) -> Vec<String> {
        let mut urls: Vec<(u64, String)> = self
            .relays
            .iter()
            .map(|r| (r.seq, r.key().clone()))
            .collect();
        urls.sort();
        urls.into_iter().map(|(_, url)| url).collect()
    }

    pub fn group_ids(&self, relay_url: &str) -> Result<Vec<String>> {
        Ok(self.relay(&normalize_relay_url(relay_url))?.group_ids())
    }

    /// Run `f` against a group ledger.
    pub fn with_ledger<R>(
        &self,
        relay_url: &str,
        group_id: &str,
        f: impl FnOnce(&GroupLedger) -> R,
    ) -> Result<R> {
        let url = normalize_relay_url(relay_url);
        let ledger = self
            .relay(&url)?
            .ledger(&url, &normalize_group_id(group_id))?;
        let ledger = ledger.read();
        Ok(f(&ledger))
    }

    /// Copy of a group's messages, oldest first.
    pub fn messages(&self, relay_url: &str, group_id: &str) -> Result<Vec<Event>> {
        self.with_ledger(relay_url, group_id, |l| l.messages().to_vec())
    }

    /// Choose the group `publish_chat` posts to.
    pub fn select(&self, relay_url: &str, group_id: &str) -> Result<()> {
        let url = normalize_relay_url(relay_url);
        let group = normalize_group_id(group_id);
        self.relay(&url)?.ledger(&url, &group)?;
        *self.selected.write() = Some((url, group));
        Ok(())
    }

    /// Selected relay URL and group id.
    pub fn selected(&self) -> Option<(String, String)> {
        self.selected.read().clone()
    }

    pub fn set_identity(&self, keys: Option<Keys>) {
        if let Some(keys) = &keys {
            info!(pubkey = %keys.public_key_hex(), "identity set");
        }
        *self.keys.write() = keys;
    }

    /// Use the hex secret key as identity and persist it.
    pub fn import_identity(&self, secret_hex: &str) -> Result<Keys> {
        let keys = Keys::from_hex(secret_hex)
            .map_err(|e| ChatError::Signing(format!("invalid secret key: {e}")))?;
        if let Some(root) = &self.options.state_root {
            prefs::save_identity(root, &keys.secret_hex()).map_err(persist_error)?;
        }
        self.set_identity(Some(keys.clone()));
        Ok(keys)
    }

    pub fn identity(&self) -> Option<Keys> {
        self.keys.read().clone()
    }

    /// Sign `text` as a chat message and publish it to the selected group.
    pub fn publish_chat(&self, text: &str) -> Result<Event> {
        if text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let (url, group) = self.selected().ok_or(ChatError::NoSelection)?;
        let keys = self.identity().ok_or(ChatError::NoIdentity)?;
        let relay = self.relay(&url)?;
        relay.ledger(&url, &group)?;
        let event = keys
            .sign(EventTemplate::chat(&group, text))
            .map_err(|e| ChatError::Signing(e.to_string()))?;
        relay.connection.publish(&event)?;
        debug!(relay = %url, group = %group, event = %event.id, "published chat message");
        Ok(event)
    }

    /// Name to show for an author.
    pub fn display_name(&self, pubkey: &str) -> String {
        self.people.display_name(pubkey)
    }

    fn relay(&self, url: &str) -> Result<Arc<ChatRelay>> {
        self.relays
            .get(url)
            .map(|r| r.value().clone())
            .ok_or_else(|| ChatError::RelayNotFound(url.to_string()))
    }

    fn connections(&self) -> Vec<Arc<RelayConnection>> {
        self.relays
            .iter()
            .map(|r| r.connection.clone())
            .filter(|c| !c.is_closed())
            .collect()
    }

    /// Write the live groups of `url` into the persisted relay list, keeping
    /// records of relays that are not connected right now.
    fn persist_relay(&self, url: &str, relay: &ChatRelay) -> Result<()> {
        let Some(root) = &self.options.state_root else {
            return Ok(());
        };
        let mut records = prefs::load_relays(root).map_err(persist_error)?;
        let record = RelayRecord {
            url: url.to_string(),
            groups: relay.group_ids(),
        };
        match records
            .iter_mut()
            .find(|r| normalize_relay_url(&r.url) == url)
        {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        prefs::save_relays(root, &records).map_err(persist_error)
    }

    /// Drop `url` from the persisted relay list. Returns whether a record
    /// was removed.
    fn forget_persisted(&self, url: &str) -> Result<bool> {
        let Some(root) = &self.options.state_root else {
            return Ok(false);
        };
        let mut records = prefs::load_relays(root).map_err(persist_error)?;
        let before = records.len();
        records.retain(|r| normalize_relay_url(&r.url) != url);
        if records.len() == before {
            return Ok(false);
        }
        prefs::save_relays(root, &records).map_err(persist_error)?;
        Ok(true)
    }

    fn clear_selection_on(&self, url: &str) {
        let mut selected = self.selected.write();
        if selected.as_ref().is_some_and(|(u, _)| u == url) {
            *selected = None;
        }
    }

    /// The relay closed a group's subscription: forget the group but keep
    /// the relay and the persisted configuration.
    fn drop_rejected_group(
        &self,
        url: &str,
        group: &str,
        ledger: &Arc<RwLock<GroupLedger>>,
        reason: String,
    ) {
        if let Ok(relay) = self.relay(url) {
            relay
                .groups
                .remove_if(group, |_, entry| Arc::ptr_eq(&entry.ledger, ledger));
        }
        {
            let mut selected = self.selected.write();
            if selected
                .as_ref()
                .is_some_and(|(u, g)| u == url && g == group)
            {
                *selected = None;
            }
        }
        self.report(&ChatError::Subscription {
            url: url.to_string(),
            group: group.to_string(),
            reason,
        });
        self.rebuild_menu();
    }

    /// Look up `author` in the background and tell the group once a name
    /// arrives, unless the group was torn down meanwhile.
    fn resolve_author(&self, author: &str, url: &str, group: &str, cancel: CancellationToken) {
        let pending = self.people.ensure(author);
        let notices = self.notices.clone();
        let relay_url = url.to_string();
        let group_id = group.to_string();
        tokio::spawn(async move {
            if let MetadataUpdate::Updated(_) = pending.await {
                if !cancel.is_cancelled() {
                    let _ = notices.send(Notification::GroupMessagesChanged {
                        relay_url,
                        group_id,
                    });
                }
            }
        });
    }

    fn notify(&self, notification: Notification) {
        let _ = self.notices.send(notification);
    }

    fn report(&self, err: &ChatError) {
        warn!(error = %err, "operation failed");
        self.notify(Notification::Error {
            message: err.to_string(),
        });
    }
}

fn persist_error(e: anyhow::Error) -> ChatError {
    ChatError::Persist(format!("{e:#}"))
}

/// Feed one group's subscription into its ledger until cancelled or closed.
async fn ingest(
    weak: Weak<RelayRegistry>,
    url: String,
    group: String,
    mut subscription: Subscription,
    ledger: Arc<RwLock<GroupLedger>>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = subscription.next_event() => next,
        };
        let Some(event) = next else { break };
        let Some(registry) = weak.upgrade() else { return };
        if registry.options.verify_sig {
            if let Err(e) = verify_event(&event) {
                debug!(relay = %url, event = %event.id, error = %e, "dropping unverified event");
                continue;
            }
        }
        let change = ledger.write().apply(event);
        match change {
            LedgerChange::Menu => registry.rebuild_menu(),
            LedgerChange::Message { index, author } => {
                debug!(relay = %url, group = %group, position = index, "message stored");
                registry.notify(Notification::GroupMessagesChanged {
                    relay_url: url.clone(),
                    group_id: group.clone(),
                });
                registry.resolve_author(&author, &url, &group, cancel.child_token());
            }
            LedgerChange::Unchanged => {}
        }
    }

    let Some(CloseReason::Relay(reason)) = subscription.close_reason().cloned() else {
        warn!(relay = %url, group = %group, "subscription ended");
        return;
    };
    let Some(registry) = weak.upgrade() else { return };
    // Waits for the add that spawned this task to finish registering it.
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {}
        _structure = registry.structure.lock() => {
            registry.drop_rejected_group(&url, &group, &ledger, reason);
        }
    }
}

/// Looks up profiles on every connected relay and keeps the newest.
struct RelayMetadataSource {
    registry: Weak<RelayRegistry>,
    wait: Duration,
}

#[async_trait]
impl MetadataSource for RelayMetadataSource {
    async fn fetch(&self, pubkey: &str) -> Option<Event> {
        let connections = self.registry.upgrade()?.connections();
        let filter = Filter::new()
            .kinds(vec![KIND_METADATA])
            .authors(vec![pubkey.to_string()])
            .limit(1);
        let filters = [filter];
        let answers = join_all(connections.iter().map(|c| c.query(&filters, self.wait))).await;
        answers
            .into_iter()
            .flatten()
            .flatten()
            .filter(|ev| ev.kind == KIND_METADATA && ev.pubkey == pubkey)
            .max_by_key(|ev| ev.created_at)
    }
}

/// Trim `url`, drop trailing slashes and default to `wss://` when no
/// websocket scheme is given.
pub fn normalize_relay_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    if url.starts_with("ws://") || url.starts_with("wss://") {
        url.to_string()
    } else {
        format!("wss://{url}")
    }
}

/// Group ids always start with `/`; an empty id is the root group.
pub fn normalize_group_id(group_id: &str) -> String {
    let group_id = group_id.trim();
    if group_id.starts_with('/') {
        group_id.to_string()
    } else {
        format!("/{group_id}")
    }
}

//! Process-wide cache of author display metadata.
//!
//! Lookups for the same author share one outstanding fetch: the first caller
//! installs a shared future in `in_flight`, later callers clone it, and the
//! future removes itself once the source has answered.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap, DashSet};
use futures_util::future::{self, BoxFuture, FutureExt, Shared};
use serde::Deserialize;
use tracing::debug;

use crate::event::{short_key, Event, KIND_METADATA};

/// Display information about an author, taken from their latest kind 0 event.
#[derive(Debug, Clone, PartialEq)]
pub struct PersonMetadata {
    pub name: Option<String>,
    pub picture: Option<String>,
    /// Timestamp of the profile event this was read from.
    pub created_at: u64,
}

#[derive(Deserialize)]
struct ProfileContent {
    name: Option<String>,
    display_name: Option<String>,
    picture: Option<String>,
}

impl PersonMetadata {
    /// Read a kind 0 event. Other kinds and malformed content yield `None`.
    pub fn from_event(ev: &Event) -> Option<Self> {
        if ev.kind != KIND_METADATA {
            return None;
        }
        let content: ProfileContent = serde_json::from_str(&ev.content).ok()?;
        let non_empty = |s: Option<String>| s.filter(|s| !s.trim().is_empty());
        Some(Self {
            name: non_empty(content.display_name).or(non_empty(content.name)),
            picture: non_empty(content.picture),
            created_at: ev.created_at,
        })
    }
}

/// Outcome of a metadata lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataUpdate {
    /// New metadata was stored; dependants should re-render.
    Updated(PersonMetadata),
    /// Nothing changed.
    Unchanged,
}

/// Where missing author metadata is fetched from.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Newest kind 0 event of `pubkey`, if any could be found.
    async fn fetch(&self, pubkey: &str) -> Option<Event>;
}

pub type PendingUpdate = Shared<BoxFuture<'static, MetadataUpdate>>;

/// Author metadata keyed by public key. Entries are never evicted.
pub struct PersonMetadataCache {
    entries: DashMap<String, PersonMetadata>,
    /// Authors already looked up, including those with no metadata.
    checked: DashSet<String>,
    in_flight: DashMap<String, PendingUpdate>,
    source: Arc<dyn MetadataSource>,
}

impl PersonMetadataCache {
    pub fn new(source: Arc<dyn MetadataSource>) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            checked: DashSet::new(),
            in_flight: DashMap::new(),
            source,
        })
    }

    pub fn get(&self, pubkey: &str) -> Option<PersonMetadata> {
        self.entries.get(pubkey).map(|m| m.clone())
    }

    /// Name to show for `pubkey`: the cached name, or the key's last eight
    /// characters when none is known.
    pub fn display_name(&self, pubkey: &str) -> String {
        self.get(pubkey)
            .and_then(|m| m.name.map(|n| n.trim().to_string()))
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| short_key(pubkey).to_string())
    }

    /// Store the profile carried by `ev` unless an equally new or newer one
    /// is already cached.
    pub fn observe(&self, ev: &Event) -> Option<PersonMetadata> {
        let meta = PersonMetadata::from_event(ev)?;
        match self.entries.entry(ev.pubkey.clone()) {
            Entry::Occupied(mut current) => {
                if current.get().created_at >= meta.created_at {
                    return None;
                }
                current.insert(meta.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(meta.clone());
            }
        }
        debug!(pubkey = %ev.pubkey, name = ?meta.name, "profile cached");
        Some(meta)
    }

    /// Make sure metadata for `pubkey` has been looked up. Known authors
    /// resolve immediately to `Unchanged`; concurrent callers for an unknown
    /// author all await the same fetch.
    pub fn ensure(self: &Arc<Self>, pubkey: &str) -> PendingUpdate {
        if self.is_settled(pubkey) {
            return unchanged();
        }
        match self.in_flight.entry(pubkey.to_string()) {
            Entry::Occupied(pending) => pending.get().clone(),
            Entry::Vacant(slot) => {
                // A fetch may have finished between the check above and
                // taking the slot.
                if self.is_settled(pubkey) {
                    return unchanged();
                }
                let cache = Arc::clone(self);
                let pubkey = pubkey.to_string();
                let pending = async move {
                    let update = match cache.source.fetch(&pubkey).await {
                        Some(ev) if ev.pubkey == pubkey => cache
                            .observe(&ev)
                            .map_or(MetadataUpdate::Unchanged, MetadataUpdate::Updated),
                        _ => MetadataUpdate::Unchanged,
                    };
                    cache.checked.insert(pubkey.clone());
                    cache.in_flight.remove(&pubkey);
                    update
                }
                .boxed()
                .shared();
                slot.insert(pending.clone());
                pending
            }
        }
    }

    fn is_settled(&self, pubkey: &str) -> bool {
        self.entries.contains_key(pubkey) || self.checked.contains(pubkey)
    }
}

fn unchanged() -> PendingUpdate {
    future::ready(MetadataUpdate::Unchanged).boxed().shared()
}

//! Per-group event history and descriptive metadata.

use std::collections::HashSet;

use tracing::debug;

use crate::event::{Event, KIND_CHAT, KIND_GROUP_METADATA, KIND_GROUP_SUBGROUPS};

/// An incoming event classified by what it means for a group.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupEvent {
    /// Kind 39000: display name and picture.
    Metadata {
        name: Option<String>,
        picture: Option<String>,
        created_at: u64,
    },
    /// Kind 39003: announced sub-group ids.
    Subgroups(Vec<String>),
    Chat(Event),
    Other(u32),
}

impl From<Event> for GroupEvent {
    fn from(ev: Event) -> Self {
        match ev.kind {
            KIND_GROUP_METADATA => GroupEvent::Metadata {
                name: ev.tag_value("name").map(str::to_string),
                picture: ev.tag_value("picture").map(str::to_string),
                created_at: ev.created_at,
            },
            KIND_GROUP_SUBGROUPS => {
                GroupEvent::Subgroups(ev.tag_values("g").map(str::to_string).collect())
            }
            KIND_CHAT => GroupEvent::Chat(ev),
            other => GroupEvent::Other(other),
        }
    }
}

/// What changed after applying an event, so callers know what to refresh.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerChange {
    /// Name, picture or sub-groups changed.
    Menu,
    /// A chat message was inserted at `index`.
    Message { index: usize, author: String },
    Unchanged,
}

/// Ordered chat history plus metadata for one group on one relay.
#[derive(Debug, Clone)]
pub struct GroupLedger {
    id: String,
    name: String,
    picture: Option<String>,
    subgroups: Vec<String>,
    messages: Vec<Event>,
    seen: HashSet<String>,
    metadata_at: Option<u64>,
}

impl GroupLedger {
    /// Empty ledger whose display name defaults to the group id.
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            picture: None,
            subgroups: Vec::new(),
            messages: Vec::new(),
            seen: HashSet::new(),
            metadata_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn picture(&self) -> Option<&str> {
        self.picture.as_deref()
    }

    pub fn subgroups(&self) -> &[String] {
        &self.subgroups
    }

    /// Chat messages, ascending by `created_at`.
    pub fn messages(&self) -> &[Event] {
        &self.messages
    }

    /// Apply one received event.
    pub fn apply(&mut self, ev: Event) -> LedgerChange {
        match GroupEvent::from(ev) {
            GroupEvent::Metadata {
                name,
                picture,
                created_at,
            } => {
                if self.metadata_at.is_some_and(|at| created_at < at) {
                    return LedgerChange::Unchanged;
                }
                self.metadata_at = Some(created_at);
                if let Some(name) = name {
                    self.name = name;
                }
                if picture.is_some() {
                    self.picture = picture;
                }
                LedgerChange::Menu
            }
            GroupEvent::Subgroups(ids) => {
                let before = self.subgroups.len();
                for id in ids {
                    if !self.subgroups.contains(&id) {
                        self.subgroups.push(id);
                    }
                }
                if self.subgroups.len() == before {
                    LedgerChange::Unchanged
                } else {
                    LedgerChange::Menu
                }
            }
            GroupEvent::Chat(ev) => match self.insert_chat(ev) {
                Some((index, author)) => LedgerChange::Message { index, author },
                None => LedgerChange::Unchanged,
            },
            GroupEvent::Other(kind) => {
                debug!(group = %self.id, kind, "ignoring event");
                LedgerChange::Unchanged
            }
        }
    }

    /// Insert a chat message unless its id was already stored.
    fn insert_chat(&mut self, ev: Event) -> Option<(usize, String)> {
        if !self.seen.insert(ev.id.clone()) {
            return None;
        }
        let author = ev.pubkey.clone();
        let index = insert_ascending(&mut self.messages, ev);
        Some((index, author))
    }
}

/// Insert `ev` after the last element whose timestamp is not greater than its
/// own, scanning from the end. Equal timestamps keep arrival order, and in-order
/// arrivals cost a single comparison.
pub fn insert_ascending(list: &mut Vec<Event>, ev: Event) -> usize {
    let index = list
        .iter()
        .rposition(|e| e.created_at <= ev.created_at)
        .map_or(0, |i| i + 1);
    list.insert(index, ev);
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::Tag,
        test_relay::{chat_event, sample_event},
    };

    fn order(ledger: &GroupLedger) -> Vec<(u64, String)> {
        ledger
            .messages()
            .iter()
            .map(|e| (e.created_at, e.id.clone()))
            .collect()
    }

    #[test]
    fn out_of_order_arrivals_end_sorted_and_stable() {
        let mut ledger = GroupLedger::new("/general");
        ledger.apply(chat_event("a1", "A", "/general", 100));
        ledger.apply(chat_event("b", "B", "/general", 90));
        ledger.apply(chat_event("a2", "A", "/general", 100));
        assert_eq!(
            order(&ledger),
            vec![(90, "b".into()), (100, "a1".into()), (100, "a2".into())]
        );
    }

    #[test]
    fn any_arrival_order_yields_sorted_stable_sequence() {
        let stamps = [5u64, 3, 5, 1, 9, 3, 3, 0, 9, 5, 2, 7];
        // Rotate the arrival order and check every permutation keeps the
        // relative order of equal timestamps.
        for shift in 0..stamps.len() {
            let mut ledger = GroupLedger::new("/");
            let arrivals: Vec<(usize, u64)> = stamps
                .iter()
                .copied()
                .enumerate()
                .cycle()
                .skip(shift)
                .take(stamps.len())
                .collect();
            for (i, ts) in &arrivals {
                ledger.apply(chat_event(&i.to_string(), "A", "/", *ts));
            }
            let stored = order(&ledger);
            assert!(stored.windows(2).all(|w| w[0].0 <= w[1].0));
            for ts in stamps {
                let arrived: Vec<String> = arrivals
                    .iter()
                    .filter(|(_, t)| *t == ts)
                    .map(|(i, _)| i.to_string())
                    .collect();
                let kept: Vec<String> = stored
                    .iter()
                    .filter(|(t, _)| *t == ts)
                    .map(|(_, id)| id.clone())
                    .collect();
                assert_eq!(arrived, kept);
            }
        }
    }

    #[test]
    fn insert_reports_position() {
        let mut list = vec![];
        assert_eq!(insert_ascending(&mut list, sample_event("a", "p", 9, 10)), 0);
        assert_eq!(insert_ascending(&mut list, sample_event("b", "p", 9, 20)), 1);
        assert_eq!(insert_ascending(&mut list, sample_event("c", "p", 9, 5)), 0);
        assert_eq!(insert_ascending(&mut list, sample_event("d", "p", 9, 10)), 2);
    }

    #[test]
    fn duplicate_chat_ids_are_ignored() {
        let mut ledger = GroupLedger::new("/");
        let ev = chat_event("x", "A", "/", 1);
        assert_eq!(
            ledger.apply(ev.clone()),
            LedgerChange::Message {
                index: 0,
                author: "A".into()
            }
        );
        assert_eq!(ledger.apply(ev), LedgerChange::Unchanged);
        assert_eq!(ledger.messages().len(), 1);
    }

    #[test]
    fn metadata_updates_name_and_picture() {
        let mut ledger = GroupLedger::new("/pizza");
        assert_eq!(ledger.name(), "/pizza");
        let mut meta = sample_event("m1", "relay", KIND_GROUP_METADATA, 10);
        meta.tags = vec![
            Tag::new("d", "/pizza"),
            Tag::new("name", "Pizza Lovers"),
            Tag::new("picture", "https://img/p.png"),
        ];
        assert_eq!(ledger.apply(meta), LedgerChange::Menu);
        assert_eq!(ledger.name(), "Pizza Lovers");
        assert_eq!(ledger.picture(), Some("https://img/p.png"));

        let mut stale = sample_event("m0", "relay", KIND_GROUP_METADATA, 5);
        stale.tags = vec![Tag::new("d", "/pizza"), Tag::new("name", "Old")];
        assert_eq!(ledger.apply(stale), LedgerChange::Unchanged);
        assert_eq!(ledger.name(), "Pizza Lovers");

        let mut renamed = sample_event("m2", "relay", KIND_GROUP_METADATA, 11);
        renamed.tags = vec![Tag::new("d", "/pizza"), Tag::new("name", "Pizza")];
        ledger.apply(renamed);
        assert_eq!(ledger.name(), "Pizza");
        assert_eq!(ledger.picture(), Some("https://img/p.png"));
    }

    #[test]
    fn subgroups_are_deduplicated_in_order() {
        let mut ledger = GroupLedger::new("/");
        let mut ann = sample_event("s1", "relay", KIND_GROUP_SUBGROUPS, 1);
        ann.tags = vec![
            Tag::new("d", "/"),
            Tag::new("g", "/a"),
            Tag::new("g", "/b"),
        ];
        assert_eq!(ledger.apply(ann.clone()), LedgerChange::Menu);
        ann.tags.push(Tag::new("g", "/c"));
        ledger.apply(ann.clone());
        assert_eq!(ledger.subgroups(), ["/a", "/b", "/c"]);
        assert_eq!(ledger.apply(ann), LedgerChange::Unchanged);
    }

    #[test]
    fn other_kinds_leave_ledger_untouched() {
        let mut ledger = GroupLedger::new("/");
        assert_eq!(
            ledger.apply(sample_event("p", "A", 0, 1)),
            LedgerChange::Unchanged
        );
        assert_eq!(
            ledger.apply(sample_event("n", "A", 1, 1)),
            LedgerChange::Unchanged
        );
        assert!(ledger.messages().is_empty());
    }
}

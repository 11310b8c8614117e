//! Subscription filters: JSON rendering for `REQ` and local matching.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::event::Event;

/// Filter parameters of a Nostr subscription.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// Restrict to specific authors.
    pub authors: Option<Vec<String>>,
    /// Restrict to event kinds.
    pub kinds: Option<Vec<u32>>,
    /// Tag filters keyed by tag name without the `#` prefix.
    pub tags: BTreeMap<String, Vec<String>>,
    /// Lower bound for `created_at`.
    pub since: Option<u64>,
    /// Upper bound for `created_at`.
    pub until: Option<u64>,
    /// Maximum number of stored events requested.
    pub limit: Option<u32>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kinds(mut self, kinds: Vec<u32>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    pub fn authors(mut self, authors: Vec<String>) -> Self {
        self.authors = Some(authors);
        self
    }

    /// Require a tag `name` whose value is one of `values`.
    pub fn tag(mut self, name: &str, values: Vec<String>) -> Self {
        let name = name.trim_start_matches('#').to_string();
        self.tags.insert(name, values);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Render the filter as the JSON object sent inside a `REQ` message.
    pub fn to_json(&self) -> Map<String, Value> {
        let mut map = Map::new();
        if let Some(authors) = &self.authors {
            if !authors.is_empty() {
                map.insert("authors".into(), strings(authors));
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.is_empty() {
                map.insert(
                    "kinds".into(),
                    Value::Array(kinds.iter().map(|k| Value::Number((*k).into())).collect()),
                );
            }
        }
        for (tag, values) in &self.tags {
            if values.is_empty() {
                continue;
            }
            map.insert(format!("#{tag}"), strings(values));
        }
        if let Some(since) = self.since {
            map.insert("since".into(), Value::Number(since.into()));
        }
        if let Some(until) = self.until {
            map.insert("until".into(), Value::Number(until.into()));
        }
        if let Some(limit) = self.limit {
            map.insert("limit".into(), Value::Number(limit.into()));
        }
        map
    }

    /// Whether `ev` satisfies every constraint of this filter. `limit` only
    /// applies to stored events on the relay and is ignored here.
    pub fn matches(&self, ev: &Event) -> bool {
        if let Some(authors) = &self.authors {
            if !authors.is_empty() && !authors.iter().any(|a| *a == ev.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.is_empty() && !kinds.contains(&ev.kind) {
                return false;
            }
        }
        for (tag, values) in &self.tags {
            if values.is_empty() {
                continue;
            }
            if !ev.tag_values(tag).any(|v| values.iter().any(|want| want == v)) {
                return false;
            }
        }
        if self.since.is_some_and(|since| ev.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| ev.created_at > until) {
            return false;
        }
        true
    }
}

fn strings(values: &[String]) -> Value {
    Value::Array(values.iter().cloned().map(Value::String).collect())
}

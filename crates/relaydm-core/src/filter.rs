//! Subscription filters
//!
//! A filter's fields are ANDed; within a list field any entry may match. An
//! event matches a REQ when it matches any one of its filters.

use serde::{Deserialize, Serialize};

use crate::event::Event;
use crate::types::{Kind, Timestamp};

/// Criteria sent in a REQ frame
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<Kind>>,
    #[serde(rename = "#e", skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<String>>,
    #[serde(rename = "#p", skip_serializing_if = "Option::is_none")]
    pub pubkeys: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id<S: Into<String>>(mut self, id: S) -> Self {
        self.ids.get_or_insert_with(Vec::new).push(id.into());
        self
    }

    pub fn author<S: Into<String>>(mut self, author: S) -> Self {
        self.authors.get_or_insert_with(Vec::new).push(author.into());
        self
    }

    pub fn kind(mut self, kind: Kind) -> Self {
        self.kinds.get_or_insert_with(Vec::new).push(kind);
        self
    }

    /// Require an `e` tag referencing `event_id`
    pub fn event<S: Into<String>>(mut self, event_id: S) -> Self {
        self.events.get_or_insert_with(Vec::new).push(event_id.into());
        self
    }

    /// Require a `p` tag referencing `pubkey`
    pub fn pubkey<S: Into<String>>(mut self, pubkey: S) -> Self {
        self.pubkeys.get_or_insert_with(Vec::new).push(pubkey.into());
        self
    }

    pub fn since(mut self, since: Timestamp) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: Timestamp) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `event` satisfies every populated field.
    ///
    /// `limit` only bounds stored-event replay and is not checked here.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id.eq_ignore_ascii_case(event.id())) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a.eq_ignore_ascii_case(event.pubkey())) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind()) {
                return false;
            }
        }
        if let Some(events) = &self.events {
            if !event
                .event_ids()
                .any(|tagged| events.iter().any(|e| e.eq_ignore_ascii_case(tagged)))
            {
                return false;
            }
        }
        if let Some(pubkeys) = &self.pubkeys {
            if !event
                .public_keys()
                .any(|tagged| pubkeys.iter().any(|p| p.eq_ignore_ascii_case(tagged)))
            {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at() < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at() > until {
                return false;
            }
        }
        true
    }
}

/// Whether `event` matches any of `filters`
pub fn matches_any(filters: &[Filter], event: &Event) -> bool {
    filters.iter().any(|filter| filter.matches(event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keys;
    use crate::event::{EventBuilder, Tag};

    #[test]
    fn test_filter_serialization_skips_unset_fields() {
        let filter = Filter::new()
            .kind(Kind::ENCRYPTED_DIRECT_MESSAGE)
            .pubkey("ab")
            .since(Timestamp::from_secs(10));

        let json = serde_json::to_string(&filter).unwrap();
        assert_eq!(json, r##"{"kinds":[4],"#p":["ab"],"since":10}"##);

        let parsed: Filter = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, filter);
    }

    #[test]
    fn test_filter_matching() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let event = EventBuilder::text_note("hi")
            .tag(Tag::public_key(&bob.public_key_hex()))
            .custom_created_at(Timestamp::from_secs(100))
            .to_event(&alice)
            .unwrap();

        assert!(Filter::new().matches(&event));
        assert!(Filter::new()
            .author(alice.public_key_hex())
            .pubkey(bob.public_key_hex())
            .kind(Kind::TEXT_NOTE)
            .matches(&event));
        assert!(!Filter::new().author(bob.public_key_hex()).matches(&event));
        assert!(!Filter::new().kind(Kind::ENCRYPTED_DIRECT_MESSAGE).matches(&event));
        assert!(!Filter::new().since(Timestamp::from_secs(101)).matches(&event));
        assert!(!Filter::new().until(Timestamp::from_secs(99)).matches(&event));
        assert!(Filter::new().id(event.id()).matches(&event));
        assert!(!Filter::new().event(event.id()).matches(&event));

        let filters = [Filter::new().author(bob.public_key_hex()), Filter::new()];
        assert!(matches_any(&filters, &event));
        assert!(!matches_any(&[], &event));
    }
}

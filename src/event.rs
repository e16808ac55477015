//! Nostr event model and subscription filters.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and the
/// following elements hold data. Common examples include:
///
/// - `d` – unique identifier for parameterized replaceable events
/// - `a` – address reference `kind:pubkey:identifier` to another replaceable event
/// - `i` – external identifier, e.g. an app's package id on a release
/// - `f` – platform the event applies to
///
/// Each tag is stored verbatim so uncommon or custom tags are preserved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

/// Core Nostr event as delivered by relays and persisted locally.
///
/// ```json
/// {
///   "id": "aa11",
///   "pubkey": "npub...",
///   "kind": 30063,
///   "created_at": 1700000000,
///   "tags": [["d", "com.example.app@1.0.0"], ["i", "com.example.app"]],
///   "content": "",
///   "sig": "deadbeef"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Kind number, e.g. `0` or `32267`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Arbitrary tags such as `d` (identifier) or `a` (address reference).
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash (not verified here).
    pub sig: String,
}

impl Event {
    /// First value of the first tag named `name`, if any.
    pub fn first_tag_value(&self, name: &str) -> Option<&str> {
        self.tags.iter().find_map(|Tag(fields)| match fields.as_slice() {
            [tag, value, ..] if tag == name => Some(value.as_str()),
            _ => None,
        })
    }

    /// All first values across tags named `name`, in tag order.
    pub fn tag_values(&self, name: &str) -> Vec<&str> {
        self.tags
            .iter()
            .filter_map(|Tag(fields)| match fields.as_slice() {
                [tag, value, ..] if tag == name => Some(value.as_str()),
                _ => None,
            })
            .collect()
    }

    /// The `d` tag value, defaulting to the empty string when absent.
    pub fn d_tag(&self) -> &str {
        self.first_tag_value("d").unwrap_or("")
    }

    /// Logical key under which this event supersedes older versions, or
    /// `None` for regular events that are kept forever.
    pub fn replaceable_key(&self) -> Option<LogicalKey> {
        match Replaceability::of(self.kind) {
            Replaceability::Regular => None,
            Replaceability::Replaceable => Some(LogicalKey {
                kind: self.kind,
                pubkey: self.pubkey.clone(),
                d_tag: String::new(),
            }),
            Replaceability::ParamReplaceable => Some(LogicalKey {
                kind: self.kind,
                pubkey: self.pubkey.clone(),
                d_tag: self.d_tag().to_string(),
            }),
        }
    }
}

/// How events of a given kind supersede each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replaceability {
    /// Kept forever; deduplicated by `id` only.
    Regular,
    /// Latest per `(kind, pubkey)` survives.
    Replaceable,
    /// Latest per `(kind, pubkey, d-tag)` survives.
    ParamReplaceable,
}

impl Replaceability {
    /// Classify a kind number per NIP-01 ranges.
    pub fn of(kind: u32) -> Self {
        match kind {
            0 | 3 => Replaceability::Replaceable,
            10000..=19999 => Replaceability::Replaceable,
            k if k >= 30000 => Replaceability::ParamReplaceable,
            _ => Replaceability::Regular,
        }
    }
}

/// Identity of the "current" slot a replaceable event occupies.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogicalKey {
    pub kind: u32,
    pub pubkey: String,
    pub d_tag: String,
}

/// Subscription filter sent to relays and understood by the local store.
///
/// Tag constraints are kept under their wire names (`"#d"`, `"#a"`, ...), so
/// the struct serializes directly into the REQ frame shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// `"#<tagname>"` keys mapping to accepted value sets.
    #[serde(flatten)]
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u32>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = String>) -> Self {
        self.authors = Some(authors.into_iter().collect());
        self
    }

    pub fn ids(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.ids = Some(ids.into_iter().collect());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Constrain a tag, e.g. `tag("d", ["slug"])` becomes `"#d": ["slug"]`.
    pub fn tag(mut self, name: &str, values: impl IntoIterator<Item = String>) -> Self {
        self.tags
            .insert(format!("#{name}"), values.into_iter().collect());
        self
    }

    /// Accepted values for a tag constraint, keyed without the `#` prefix.
    pub fn tag_filter(&self, name: &str) -> Option<&Vec<String>> {
        self.tags.get(&format!("#{name}"))
    }

    /// Whether the event satisfies every tag constraint in this filter.
    pub fn matches_tags(&self, ev: &Event) -> bool {
        self.tags.iter().all(|(key, values)| {
            let name = key.trim_start_matches('#');
            ev.tags.iter().any(|Tag(fields)| {
                matches!(fields.as_slice(), [tag, value, ..]
                    if tag == name && values.iter().any(|v| v == value))
            })
        })
    }

    /// Whether the event falls inside the `since..=until` window.
    pub fn matches_window(&self, ev: &Event) -> bool {
        self.since.map_or(true, |s| ev.created_at >= s)
            && self.until.map_or(true, |u| ev.created_at <= u)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: u32, tags: Vec<Vec<&str>>) -> Event {
        Event {
            id: "aa11".into(),
            pubkey: "p1".into(),
            kind,
            created_at: 1,
            tags: tags
                .into_iter()
                .map(|t| Tag(t.into_iter().map(String::from).collect()))
                .collect(),
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn replaceability_classes() {
        assert_eq!(Replaceability::of(1), Replaceability::Regular);
        assert_eq!(Replaceability::of(0), Replaceability::Replaceable);
        assert_eq!(Replaceability::of(10002), Replaceability::Replaceable);
        assert_eq!(Replaceability::of(30063), Replaceability::ParamReplaceable);
        assert_eq!(Replaceability::of(32267), Replaceability::ParamReplaceable);
    }

    #[test]
    fn logical_key_includes_d_tag_only_when_parameterized() {
        let profile = event(0, vec![vec!["d", "ignored"]]);
        let key = profile.replaceable_key().unwrap();
        assert_eq!(key.d_tag, "");

        let app = event(32267, vec![vec!["d", "com.example.app"]]);
        let key = app.replaceable_key().unwrap();
        assert_eq!(key.d_tag, "com.example.app");

        assert!(event(1, vec![]).replaceable_key().is_none());
    }

    #[test]
    fn tag_accessors() {
        let ev = event(
            32267,
            vec![vec!["d", "slug"], vec!["f", "android"], vec!["f", "linux"]],
        );
        assert_eq!(ev.first_tag_value("d"), Some("slug"));
        assert_eq!(ev.tag_values("f"), vec!["android", "linux"]);
        assert_eq!(ev.first_tag_value("x"), None);
        assert_eq!(event(1, vec![]).d_tag(), "");
    }

    #[test]
    fn filter_serializes_tag_constraints_with_hash_prefix() {
        let filter = Filter::new()
            .kinds([32267])
            .tag("d", ["slug".to_string()])
            .limit(5);
        let val = serde_json::to_value(&filter).unwrap();
        assert_eq!(val["kinds"][0], 32267);
        assert_eq!(val["#d"][0], "slug");
        assert_eq!(val["limit"], 5);
        assert!(val.get("authors").is_none());
    }

    #[test]
    fn filter_matches_tags_and_window() {
        let filter = Filter::new()
            .tag("d", ["slug".to_string()])
            .since(10)
            .until(20);
        let mut ev = event(32267, vec![vec!["d", "slug"]]);
        ev.created_at = 15;
        assert!(filter.matches_tags(&ev));
        assert!(filter.matches_window(&ev));
        ev.created_at = 21;
        assert!(!filter.matches_window(&ev));
        let other = event(32267, vec![vec!["d", "other"]]);
        assert!(!filter.matches_tags(&other));
    }
}

//! Pure resolution of the replaceable-event model.
//!
//! No I/O happens here: callers batch-fetch candidate events first and these
//! functions compute the deterministic "current" view. Ordering is pinned to
//! `created_at` descending with ties broken by `id` ascending, so the
//! lexicographically smallest id wins a timestamp tie everywhere.

use std::collections::{HashMap, HashSet};

use crate::event::Event;
use crate::models::{App, AppRef, AppStack};

/// Sort newest-first, ties broken by `id` ascending.
pub fn sort_events_desc(events: &mut [Event]) {
    events.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Keep only the latest event per logical key produced by `key_fn`.
///
/// Events for which `key_fn` returns `None` (e.g. a required tag is missing)
/// are excluded entirely. The result stays in newest-first order.
pub fn dedupe_replaceable<F>(mut events: Vec<Event>, key_fn: F) -> Vec<Event>
where
    F: Fn(&Event) -> Option<String>,
{
    sort_events_desc(&mut events);
    let mut seen = HashSet::new();
    events.retain(|ev| match key_fn(ev) {
        Some(key) => seen.insert(key),
        None => false,
    });
    events
}

/// Latest app event per identity, for resolving releases to their apps.
///
/// Built once from a single batch of candidates so resolution never goes
/// back to a data source per release.
pub struct AppLookup {
    exact: HashMap<(String, String), Event>,
    by_identifier: HashMap<String, Event>,
}

impl AppLookup {
    pub fn build(mut app_events: Vec<Event>) -> Self {
        sort_events_desc(&mut app_events);
        let mut exact = HashMap::new();
        let mut by_identifier = HashMap::new();
        for ev in app_events {
            let d_tag = match ev.first_tag_value("d") {
                Some(d) if !d.is_empty() => d.to_string(),
                _ => continue,
            };
            by_identifier
                .entry(d_tag.clone())
                .or_insert_with(|| ev.clone());
            exact.entry((ev.pubkey.clone(), d_tag)).or_insert(ev);
        }
        Self {
            exact,
            by_identifier,
        }
    }

    /// Resolve an identifier to an app event, preferring an exact
    /// `(release_pubkey, identifier)` match and falling back to the latest
    /// app anywhere carrying that identifier.
    pub fn resolve(&self, release_pubkey: &str, identifier: &str) -> Option<&Event> {
        self.exact
            .get(&(release_pubkey.to_string(), identifier.to_string()))
            .or_else(|| self.by_identifier.get(identifier))
    }
}

/// Union of member refs across stacks, deduplicated by `(pubkey, identifier)`
/// and preserving first-seen order, so each app is resolved once.
pub fn unique_app_refs(stacks: &[AppStack]) -> Vec<AppRef> {
    let mut seen = HashSet::new();
    let mut refs = Vec::new();
    for stack in stacks {
        for app_ref in &stack.app_refs {
            if seen.insert((app_ref.pubkey.clone(), app_ref.identifier.clone())) {
                refs.push(app_ref.clone());
            }
        }
    }
    refs
}

/// Map resolved apps back onto one stack, preserving the stack's original
/// ref order. Unresolvable refs are skipped; an empty result is valid.
pub fn apps_for_stack(
    stack: &AppStack,
    apps_by_ref: &HashMap<(String, String), App>,
) -> Vec<App> {
    stack
        .app_refs
        .iter()
        .filter_map(|r| apps_by_ref.get(&(r.pubkey.clone(), r.identifier.clone())))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;
    use crate::models::{parse_app, parse_app_stack, KIND_APP, KIND_APP_STACK};

    fn event(id: &str, pubkey: &str, kind: u32, d: Option<&str>, created_at: u64) -> Event {
        let mut tags = vec![];
        if let Some(d) = d {
            tags.push(Tag(vec!["d".into(), d.into()]));
        }
        Event {
            id: id.into(),
            pubkey: pubkey.into(),
            kind,
            created_at,
            tags,
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn latest_wins_per_key() {
        let events = vec![
            event("cc33", "p1", KIND_APP, Some("app"), 10),
            event("aa11", "p1", KIND_APP, Some("app"), 30),
            event("bb22", "p1", KIND_APP, Some("app"), 20),
            event("dd44", "p2", KIND_APP, Some("app"), 5),
        ];
        let deduped = dedupe_replaceable(events, |ev| {
            ev.first_tag_value("d").map(|d| format!("{}:{}", ev.pubkey, d))
        });
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].id, "aa11");
        assert_eq!(deduped[1].id, "dd44");
    }

    #[test]
    fn timestamp_tie_breaks_to_smallest_id() {
        // Pinned rule: created_at desc, id asc, first per key wins.
        let events = vec![
            event("ff66", "p1", KIND_APP, Some("app"), 10),
            event("aa11", "p1", KIND_APP, Some("app"), 10),
            event("cc33", "p1", KIND_APP, Some("app"), 10),
        ];
        let deduped = dedupe_replaceable(events, |ev| Some(ev.pubkey.clone()));
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].id, "aa11");
    }

    #[test]
    fn missing_key_excludes_event() {
        let events = vec![
            event("aa11", "p1", KIND_APP, Some("app"), 10),
            event("bb22", "p1", KIND_APP, None, 20),
        ];
        let deduped = dedupe_replaceable(events, |ev| {
            ev.first_tag_value("d").map(String::from)
        });
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].id, "aa11");
    }

    #[test]
    fn lookup_prefers_exact_match_then_identifier_fallback() {
        let own = event("aa11", "author", KIND_APP, Some("com.example.app"), 10);
        let foreign = event("bb22", "other", KIND_APP, Some("com.example.app"), 20);
        let lookup = AppLookup::build(vec![own, foreign]);

        // Exact (pubkey, identifier) wins even though the foreign app is newer.
        assert_eq!(lookup.resolve("author", "com.example.app").unwrap().id, "aa11");
        // No exact match for this pubkey: fall back to the latest anywhere.
        assert_eq!(lookup.resolve("p-x", "com.example.app").unwrap().id, "bb22");
        assert!(lookup.resolve("p-x", "com.unknown").is_none());
    }

    #[test]
    fn stack_resolution_preserves_ref_order_and_skips_missing() {
        let stack_event = Event {
            id: "s1".repeat(2),
            pubkey: "curator".into(),
            kind: KIND_APP_STACK,
            created_at: 1,
            tags: vec![
                Tag(vec!["d".into(), "favs".into()]),
                Tag(vec!["a".into(), "32267:p1:com.one".into()]),
                Tag(vec!["a".into(), "32267:p1:com.missing".into()]),
                Tag(vec!["a".into(), "32267:p2:com.three".into()]),
            ],
            content: String::new(),
            sig: String::new(),
        };
        let stack = parse_app_stack(&stack_event).unwrap();

        let mut apps_by_ref = HashMap::new();
        for (id, pk, d) in [("aa11", "p1", "com.one"), ("bb22", "p2", "com.three")] {
            let app = parse_app(&event(id, pk, KIND_APP, Some(d), 1)).unwrap();
            apps_by_ref.insert((pk.to_string(), d.to_string()), app);
        }

        let apps = apps_for_stack(&stack, &apps_by_ref);
        assert_eq!(apps.len(), 2);
        assert_eq!(apps[0].d_tag, "com.one");
        assert_eq!(apps[1].d_tag, "com.three");
    }

    #[test]
    fn unique_refs_dedupe_across_stacks() {
        let mk = |d: &str, refs: Vec<&str>| {
            let mut tags = vec![Tag(vec!["d".into(), d.into()])];
            for r in refs {
                tags.push(Tag(vec!["a".into(), r.into()]));
            }
            parse_app_stack(&Event {
                id: format!("{d}11"),
                pubkey: "curator".into(),
                kind: KIND_APP_STACK,
                created_at: 1,
                tags,
                content: String::new(),
                sig: String::new(),
            })
            .unwrap()
        };
        let stacks = vec![
            mk("one", vec!["32267:p1:com.a", "32267:p1:com.b"]),
            mk("two", vec!["32267:p1:com.b", "32267:p2:com.c"]),
        ];
        let refs = unique_app_refs(&stacks);
        let ids: Vec<&str> = refs.iter().map(|r| r.identifier.as_str()).collect();
        assert_eq!(ids, vec!["com.a", "com.b", "com.c"]);
    }
}

//! Catalog queries: app listings ranked by release, stacks with resolved
//! members and creator profiles, detail lookups, and release history.
//!
//! Listings merge the durable store with live relay results where fresh data
//! matters, dedupe replaceable events, and hand the relay-sourced events back
//! to the caller as seeds for background persistence. Pagination is
//! cursor-based: a page returns `next_cursor` only when its underlying
//! fetch came back full, and the cursor is the timestamp just below the
//! oldest event consulted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::{sync::Mutex, time::Instant};

use crate::event::{Event, Filter};
use crate::models::{
    app_address, parse_app, parse_app_stack, parse_profile, parse_release, App, AppStack, Profile,
    Release, KIND_APP, KIND_APP_STACK, KIND_PROFILE, KIND_RELEASE,
};
use crate::relay::RelayPool;
use crate::resolve::{
    apps_for_stack, dedupe_replaceable, sort_events_desc, unique_app_refs, AppLookup,
};
use crate::store::Store;

/// A found profile stays valid this long.
const PROFILE_TTL_HIT: Duration = Duration::from_secs(30 * 60);
/// A miss is retried sooner than a hit is refreshed.
const PROFILE_TTL_MISS: Duration = Duration::from_secs(5 * 60);
/// Upper bound on release history page size.
const RELEASES_CAP: usize = 200;
/// Replaceable dedupe shrinks result sets, so the stack listing fetches
/// extra events per page.
const LIST_OVERFETCH: usize = 3;

/// An app in a release-ranked listing, paired with the release that ranks it.
#[derive(Debug, Clone, Serialize)]
pub struct ListedApp {
    pub app: App,
    pub release: Release,
}

/// Page of apps ordered by latest release.
#[derive(Debug, Clone, Serialize)]
pub struct AppListing {
    pub items: Vec<ListedApp>,
    pub next_cursor: Option<u64>,
    #[serde(skip)]
    pub seed_events: Vec<Event>,
}

/// A stack with its members resolved to full apps, in curation order.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedStack {
    pub stack: AppStack,
    pub apps: Vec<App>,
    pub creator: Option<Profile>,
}

/// Page of resolved stacks.
#[derive(Debug, Clone, Serialize)]
pub struct StackPage {
    pub items: Vec<ResolvedStack>,
    pub next_cursor: Option<u64>,
    #[serde(skip)]
    pub seed_events: Vec<Event>,
}

/// Full detail for a single stack.
#[derive(Debug, Clone, Serialize)]
pub struct StackDetail {
    pub stack: AppStack,
    pub apps: Vec<App>,
    pub creator: Option<Profile>,
    #[serde(skip)]
    pub seed_events: Vec<Event>,
}

struct ProfileEntry {
    event: Option<Event>,
    fetched_at: Instant,
}

/// Read side of the catalog: store plus relay pool plus profile cache.
pub struct CatalogService {
    store: Store,
    pool: Arc<RelayPool>,
    catalog_relays: Vec<String>,
    profile_relays: Vec<String>,
    /// When set, apps are filtered to this platform (`f` tag).
    platform: Option<String>,
    profiles: Mutex<HashMap<String, ProfileEntry>>,
}

impl CatalogService {
    pub fn new(
        store: Store,
        pool: Arc<RelayPool>,
        catalog_relays: Vec<String>,
        profile_relays: Vec<String>,
        platform: Option<String>,
    ) -> Self {
        Self {
            store,
            pool,
            catalog_relays,
            profile_relays,
            platform,
            profiles: Mutex::new(HashMap::new()),
        }
    }

    /// Apps ranked by their latest release, newest first. One entry per app:
    /// when several releases of the same app fall in the window, the newest
    /// carries it and the rest are skipped. Served from the store, which the
    /// sink keeps current with relay-sourced events.
    ///
    /// Pagination walks the release timeline: each page covers exactly
    /// `limit` releases and the cursor sits just below the oldest of them,
    /// so an app whose release is buried under a chatty neighbor's history
    /// still surfaces on a later page.
    pub fn apps_by_release(&self, limit: usize, until: Option<u64>) -> Result<AppListing> {
        let limit = limit.max(1);
        let mut filter = Filter::new().kinds([KIND_RELEASE]).limit(limit);
        if let Some(until) = until {
            filter = filter.until(until);
        }
        let release_events = self.store.query(&filter)?;
        // The cursor advances over releases, not resolved apps: a page whose
        // releases all collapse onto already-seen apps still moves forward.
        let next_cursor = if release_events.len() == limit {
            release_events
                .last()
                .map(|ev| ev.created_at.saturating_sub(1))
        } else {
            None
        };
        let releases: Vec<Release> = release_events.iter().filter_map(parse_release).collect();
        if releases.is_empty() {
            return Ok(AppListing {
                items: vec![],
                next_cursor,
                seed_events: release_events,
            });
        }

        let identifiers: Vec<String> = releases
            .iter()
            .map(|r| r.identifier.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let mut app_filter = Filter::new().kinds([KIND_APP]).tag("d", identifiers);
        if let Some(platform) = &self.platform {
            app_filter = app_filter.tag("f", [platform.clone()]);
        }
        let lookup = AppLookup::build(self.store.query(&app_filter)?);

        let mut seen_apps = HashSet::new();
        let mut items = vec![];
        let mut selected_apps = vec![];
        for release in releases {
            let Some(app_event) = lookup.resolve(&release.pubkey, &release.identifier) else {
                continue;
            };
            let Some(app) = parse_app(app_event) else {
                continue;
            };
            if !seen_apps.insert((app.pubkey.clone(), app.d_tag.clone())) {
                continue;
            }
            selected_apps.push(app_event.clone());
            items.push(ListedApp { app, release });
        }
        let seed_events = merge_by_id(release_events, selected_apps);
        Ok(AppListing {
            items,
            next_cursor,
            seed_events,
        })
    }

    /// Public stacks, newest first, with members and creators resolved.
    /// Live relay results are merged with the store so a freshly published
    /// stack shows up before the sink has persisted it.
    pub async fn stacks(
        &self,
        limit: usize,
        until: Option<u64>,
        authors: Option<Vec<String>>,
    ) -> Result<StackPage> {
        let limit = limit.max(1);
        let mut filter = Filter::new()
            .kinds([KIND_APP_STACK])
            .limit(limit * LIST_OVERFETCH);
        if let Some(until) = until {
            filter = filter.until(until);
        }
        if let Some(authors) = authors {
            filter = filter.authors(authors);
        }
        let relay_events = self.pool.query_events(&self.catalog_relays, &filter).await;
        let mut seed_events = relay_events.clone();
        let mut merged = merge_by_id(relay_events, self.store.query(&filter)?);
        sort_events_desc(&mut merged);

        // Parse drops encrypted and malformed stacks before dedupe, so a
        // valid older version still shows when the newest is private.
        let mut stacks: Vec<AppStack> = vec![];
        let mut seen = HashSet::new();
        for ev in &merged {
            let Some(stack) = parse_app_stack(ev) else {
                continue;
            };
            if seen.insert((stack.pubkey.clone(), stack.d_tag.clone())) {
                stacks.push(stack);
            }
        }
        stacks.truncate(limit);

        let pubkeys: Vec<String> = stacks.iter().map(|s| s.pubkey.clone()).collect();
        let (members, (profiles, profile_seeds)) =
            tokio::join!(self.resolve_members(&stacks), self.profiles_for(pubkeys));
        let (apps_by_ref, member_seeds) = members?;
        seed_events.extend(member_seeds);
        seed_events.extend(profile_seeds);

        let next_cursor = if stacks.len() == limit {
            stacks.last().map(|s| s.created_at.saturating_sub(1))
        } else {
            None
        };
        let items = stacks
            .into_iter()
            .map(|stack| {
                let apps = apps_for_stack(&stack, &apps_by_ref);
                let creator = profiles.get(&stack.pubkey).cloned();
                ResolvedStack {
                    stack,
                    apps,
                    creator,
                }
            })
            .collect();
        Ok(StackPage {
            items,
            next_cursor,
            seed_events,
        })
    }

    /// A single app by address, newest version wins across store and relays.
    pub async fn app(&self, pubkey: &str, identifier: &str) -> Result<Option<App>> {
        let filter = Filter::new()
            .kinds([KIND_APP])
            .authors([pubkey.to_string()])
            .tag("d", [identifier.to_string()])
            .limit(3);
        let relay_events = self.pool.query_events(&self.catalog_relays, &filter).await;
        let mut merged = merge_by_id(relay_events, self.store.query(&filter)?);
        sort_events_desc(&mut merged);
        Ok(merged.first().and_then(parse_app))
    }

    /// A single stack by address with members and creator resolved.
    pub async fn stack(&self, pubkey: &str, identifier: &str) -> Result<Option<StackDetail>> {
        let filter = Filter::new()
            .kinds([KIND_APP_STACK])
            .authors([pubkey.to_string()])
            .tag("d", [identifier.to_string()])
            .limit(3);
        let relay_events = self.pool.query_events(&self.catalog_relays, &filter).await;
        let mut seed_events = relay_events.clone();
        let mut merged = merge_by_id(relay_events, self.store.query(&filter)?);
        sort_events_desc(&mut merged);
        let Some(stack) = merged.iter().find_map(|ev| parse_app_stack(ev)) else {
            return Ok(None);
        };

        let (members, (profiles, profile_seeds)) = tokio::join!(
            self.resolve_members(std::slice::from_ref(&stack)),
            self.profiles_for([pubkey.to_string()])
        );
        let (apps_by_ref, member_seeds) = members?;
        seed_events.extend(member_seeds);
        seed_events.extend(profile_seeds);
        let apps = apps_for_stack(&stack, &apps_by_ref);
        let creator = profiles.get(&stack.pubkey).cloned();
        Ok(Some(StackDetail {
            stack,
            apps,
            creator,
            seed_events,
        }))
    }

    /// Release history for an app, newest first, via its address tag.
    pub async fn releases_for_app(
        &self,
        pubkey: &str,
        identifier: &str,
        limit: usize,
    ) -> Result<Vec<Release>> {
        let limit = limit.clamp(1, RELEASES_CAP);
        let filter = Filter::new()
            .kinds([KIND_RELEASE])
            .tag("a", [app_address(pubkey, identifier)])
            .limit(limit);
        let relay_events = self.pool.query_events(&self.catalog_relays, &filter).await;
        let merged = merge_by_id(relay_events, self.store.query(&filter)?);
        // A release edited by its author shows up once, newest version only.
        let merged = dedupe_replaceable(merged, replaceable_key_string);
        let mut releases: Vec<Release> = merged.iter().filter_map(parse_release).collect();
        releases.truncate(limit);
        Ok(releases)
    }

    /// The newest release pointing at an app, matched by derived identifier
    /// rather than address tag so untagged releases are found too.
    pub async fn latest_release_for_app(
        &self,
        pubkey: &str,
        identifier: &str,
    ) -> Result<Option<Release>> {
        let filter = Filter::new()
            .kinds([KIND_RELEASE])
            .authors([pubkey.to_string()])
            .limit(RELEASES_CAP);
        let relay_events = self.pool.query_events(&self.catalog_relays, &filter).await;
        let merged = merge_by_id(relay_events, self.store.query(&filter)?);
        let merged = dedupe_replaceable(merged, replaceable_key_string);
        Ok(merged
            .iter()
            .filter_map(parse_release)
            .find(|r| r.identifier == identifier))
    }

    /// Apps published by one author, newest first.
    pub fn apps_by_author(&self, pubkey: &str, limit: usize) -> Result<Vec<App>> {
        let filter = Filter::new()
            .kinds([KIND_APP])
            .authors([pubkey.to_string()])
            .limit(limit.max(1));
        let events = self.store.query(&filter)?;
        Ok(events.iter().filter_map(parse_app).collect())
    }

    /// Public stacks curated by one author, newest first, unresolved.
    pub fn stacks_by_author(&self, pubkey: &str, limit: usize) -> Result<Vec<AppStack>> {
        let filter = Filter::new()
            .kinds([KIND_APP_STACK])
            .authors([pubkey.to_string()])
            .limit(limit.max(1));
        let events = self.store.query(&filter)?;
        Ok(events.iter().filter_map(parse_app_stack).collect())
    }

    /// Fetch profiles for a set of pubkeys, through the TTL cache. Invalid
    /// keys are dropped; a pubkey with no profile is cached as a miss so
    /// dead keys do not hammer the relays. Also returns the winning raw
    /// kind-0 events so callers can hand them to the persistence sink.
    pub async fn profiles_for(
        &self,
        pubkeys: impl IntoIterator<Item = String>,
    ) -> (HashMap<String, Profile>, Vec<Event>) {
        let wanted: Vec<String> = pubkeys
            .into_iter()
            .filter_map(|pk| normalize_pubkey(&pk))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if wanted.is_empty() {
            return (HashMap::new(), vec![]);
        }

        let mut found: HashMap<String, Profile> = HashMap::new();
        let mut raw: Vec<Event> = vec![];
        let mut missing: Vec<String> = vec![];
        {
            let cache = self.profiles.lock().await;
            let now = Instant::now();
            for pk in &wanted {
                match cache.get(pk) {
                    Some(entry) if entry.fresh_at(now) => {
                        if let Some(ev) = &entry.event {
                            found.insert(pk.clone(), parse_profile(ev));
                            raw.push(ev.clone());
                        }
                    }
                    _ => missing.push(pk.clone()),
                }
            }
        }
        if missing.is_empty() {
            return (found, raw);
        }

        let filter = Filter::new().kinds([KIND_PROFILE]).authors(missing.clone());
        let mut events = self
            .pool
            .query_events(&self.profile_relays, &filter)
            .await;
        sort_events_desc(&mut events);
        let mut latest: HashMap<String, Event> = HashMap::new();
        for ev in events {
            if ev.kind != KIND_PROFILE {
                continue;
            }
            latest.entry(ev.pubkey.clone()).or_insert(ev);
        }

        let mut cache = self.profiles.lock().await;
        let now = Instant::now();
        for pk in missing {
            let event = latest.remove(&pk);
            if let Some(ev) = &event {
                found.insert(pk.clone(), parse_profile(ev));
                raw.push(ev.clone());
            }
            cache.insert(pk, ProfileEntry {
                event,
                fetched_at: now,
            });
        }
        (found, raw)
    }

    /// Resolve stack members to apps, keyed by `(pubkey, identifier)`.
    /// Store and relays are both consulted; relay events come back as seeds.
    async fn resolve_members(
        &self,
        stacks: &[AppStack],
    ) -> Result<(HashMap<(String, String), App>, Vec<Event>)> {
        let refs = unique_app_refs(stacks);
        if refs.is_empty() {
            return Ok((HashMap::new(), vec![]));
        }
        let authors: Vec<String> = refs
            .iter()
            .map(|r| r.pubkey.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let identifiers: Vec<String> = refs
            .iter()
            .map(|r| r.identifier.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let filter = Filter::new()
            .kinds([KIND_APP])
            .authors(authors)
            .tag("d", identifiers);
        let relay_events = self.pool.query_events(&self.catalog_relays, &filter).await;
        let seeds = relay_events.clone();
        let mut merged = merge_by_id(relay_events, self.store.query(&filter)?);
        sort_events_desc(&mut merged);

        let mut apps = HashMap::new();
        for ev in &merged {
            let Some(app) = parse_app(ev) else { continue };
            apps.entry((app.pubkey.clone(), app.d_tag.clone()))
                .or_insert(app);
        }
        Ok((apps, seeds))
    }
}

impl ProfileEntry {
    fn fresh_at(&self, now: Instant) -> bool {
        let ttl = if self.event.is_some() {
            PROFILE_TTL_HIT
        } else {
            PROFILE_TTL_MISS
        };
        now.duration_since(self.fetched_at) < ttl
    }
}

/// Replaceable identity as a flat string, for [`dedupe_replaceable`].
fn replaceable_key_string(ev: &Event) -> Option<String> {
    ev.replaceable_key()
        .map(|k| format!("{}:{}:{}", k.kind, k.pubkey, k.d_tag))
}

/// Merge two event lists, deduplicating by id and keeping `a`'s copy.
fn merge_by_id(a: Vec<Event>, b: Vec<Event>) -> Vec<Event> {
    let mut seen = HashSet::new();
    let mut out = vec![];
    for ev in a.into_iter().chain(b) {
        if seen.insert(ev.id.clone()) {
            out.push(ev);
        }
    }
    out
}

/// Lowercase 64-char hex, or nothing.
fn normalize_pubkey(pk: &str) -> Option<String> {
    let pk = pk.trim().to_lowercase();
    if pk.len() == 64 && pk.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(pk)
    } else {
        None
    }
}

//! File-backed durable event store.
//!
//! Events live under `events/aa/bb/<id>.json`, sharded by id prefix, with
//! append-only id indexes under `index/` and per-logical-key pointer files
//! under `latest/`. Index files tolerate stale lines: a deleted event simply
//! fails to load at read time and is skipped.

use std::{
    collections::HashSet,
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{bail, Result};
use serde_json::to_writer;
use walkdir::WalkDir;

use crate::event::{Event, Filter, LogicalKey};
use crate::resolve::sort_events_desc;

/// Tag names maintained as value indexes.
const INDEXED_TAGS: [&str; 5] = ["d", "t", "a", "i", "f"];

/// Persistent store for events and indexes rooted at `root`.
#[derive(Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Create a handle rooted at `root` without touching the filesystem.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Open an existing store. Fails when the tree was never initialized:
    /// there is no fallback data source, so this is fatal at service start.
    pub fn open(root: PathBuf) -> Result<Self> {
        if !root.join("events").is_dir() {
            bail!(
                "event store not initialized at {} (run `init` first)",
                root.display()
            );
        }
        Ok(Self { root })
    }

    /// Ensure the on-disk directory structure exists.
    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(self.root.join("events"))?;
        fs::create_dir_all(self.root.join("index/by-author"))?;
        fs::create_dir_all(self.root.join("index/by-kind"))?;
        for tag in INDEXED_TAGS {
            fs::create_dir_all(self.root.join("index/by-tag").join(tag))?;
        }
        fs::create_dir_all(self.root.join("latest"))?;
        Ok(())
    }

    /// Write a batch of events, deduplicating by id and applying
    /// latest-wins for replaceable events: an event older than the stored
    /// one for its logical key is never inserted, and the superseded event
    /// file is deleted in the same put as the insert of the new one.
    /// Idempotent: re-putting a stored batch is a no-op.
    pub fn put(&self, events: &[Event]) -> Result<()> {
        let mut seen = HashSet::new();
        for ev in events {
            if !id_fits_on_disk(&ev.id) || !seen.insert(ev.id.as_str()) {
                continue;
            }
            self.put_one(ev)?;
        }
        Ok(())
    }

    fn put_one(&self, ev: &Event) -> Result<()> {
        if self.event_path(&ev.id).exists() {
            return Ok(());
        }
        match ev.replaceable_key() {
            None => {
                self.write_event(ev)?;
                self.index_event(ev)?;
            }
            Some(key) => {
                let stored = self
                    .read_latest_pointer(&key)
                    .and_then(|id| self.load_event(&id));
                if let Some(current) = &stored {
                    let incoming_wins = ev.created_at > current.created_at
                        || (ev.created_at == current.created_at && ev.id < current.id);
                    if !incoming_wins {
                        return Ok(());
                    }
                }
                self.write_event(ev)?;
                self.index_event(ev)?;
                self.write_latest_pointer(&key, &ev.id)?;
                if let Some(current) = stored {
                    // Readers follow the pointer, so removing the loser after
                    // the swap never exposes a missing row for the key.
                    let _ = fs::remove_file(self.event_path(&current.id));
                }
            }
        }
        Ok(())
    }

    /// Execute an intersection-based query over the indexes, then apply
    /// time-window and tag filters, newest-first ordering, replaceable
    /// deduplication, and the limit. An unconstrained filter returns empty.
    pub fn query(&self, filter: &Filter) -> Result<Vec<Event>> {
        let mut sets: Vec<HashSet<String>> = vec![];
        if let Some(ids) = &filter.ids {
            sets.push(ids.iter().cloned().collect());
        }
        if let Some(authors) = &filter.authors {
            sets.push(self.load_ids("index/by-author", authors)?);
        }
        if let Some(kinds) = &filter.kinds {
            let keys: Vec<String> = kinds.iter().map(|k| k.to_string()).collect();
            sets.push(self.load_ids("index/by-kind", &keys)?);
        }
        for tag in INDEXED_TAGS {
            if let Some(values) = filter.tag_filter(tag) {
                sets.push(self.load_ids(&format!("index/by-tag/{tag}"), values)?);
            }
        }
        if sets.is_empty() {
            return Ok(vec![]);
        }
        let mut iter = sets.into_iter();
        let mut ids = iter.next().unwrap_or_default();
        for s in iter {
            ids = ids.intersection(&s).cloned().collect();
        }

        let mut events: Vec<Event> = ids
            .into_iter()
            .filter_map(|id| self.load_event(&id))
            .filter(|ev| filter.matches_window(ev) && filter.matches_tags(ev))
            .collect();
        sort_events_desc(&mut events);
        // The store keeps one current event per key, but stale index lines
        // can briefly resurface a loser; drop it here as well.
        let mut seen = HashSet::new();
        events.retain(|ev| match ev.replaceable_key() {
            Some(key) => seen.insert(key),
            None => true,
        });
        if let Some(limit) = filter.limit {
            events.truncate(limit);
        }
        Ok(events)
    }

    /// Rebuild indexes and latest pointers from the `events/` tree,
    /// deleting any superseded replaceable events found on disk.
    pub fn reindex(&self) -> Result<()> {
        let mut all: Vec<Event> = vec![];
        for entry in WalkDir::new(self.root.join("events")) {
            let entry = entry?;
            if entry.file_type().is_file() {
                let data = fs::read_to_string(entry.path())?;
                if let Ok(ev) = serde_json::from_str::<Event>(&data) {
                    if id_fits_on_disk(&ev.id) {
                        all.push(ev);
                    }
                }
            }
        }

        for dir in ["index", "latest"] {
            let path = self.root.join(dir);
            if path.exists() {
                fs::remove_dir_all(&path)?;
            }
        }
        self.init()?;

        sort_events_desc(&mut all);
        let mut winners: HashSet<LogicalKey> = HashSet::new();
        for ev in &all {
            match ev.replaceable_key() {
                Some(key) => {
                    if winners.insert(key.clone()) {
                        self.index_event(ev)?;
                        self.write_latest_pointer(&key, &ev.id)?;
                    } else {
                        let _ = fs::remove_file(self.event_path(&ev.id));
                    }
                }
                None => self.index_event(ev)?,
            }
        }
        Ok(())
    }

    /// Write the event JSON atomically to its canonical path.
    fn write_event(&self, ev: &Event) -> Result<()> {
        let path = self.event_path(&ev.id);
        let parent = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent)?;
        let tmp = tempfile::NamedTempFile::new_in(&parent)?;
        to_writer(&tmp, ev)?;
        tmp.persist(&path)?;
        Ok(())
    }

    /// Update id indexes for an event.
    fn index_event(&self, ev: &Event) -> Result<()> {
        self.append_index("index/by-author", &ev.pubkey, &ev.id)?;
        self.append_index("index/by-kind", &ev.kind.to_string(), &ev.id)?;
        for tag in INDEXED_TAGS {
            for value in ev.tag_values(tag) {
                self.append_index(&format!("index/by-tag/{tag}"), value, &ev.id)?;
            }
        }
        Ok(())
    }

    /// Append an event id to the index file under `prefix/name.txt`.
    fn append_index(&self, prefix: &str, name: &str, id: &str) -> Result<()> {
        let path = self
            .root
            .join(prefix)
            .join(format!("{}.txt", safe_component(name)));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut f = fs::OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(f, "{}", id)?;
        Ok(())
    }

    fn latest_path(&self, key: &LogicalKey) -> PathBuf {
        self.root.join("latest").join(safe_component(&format!(
            "{}.{}.{}",
            key.pubkey, key.kind, key.d_tag
        )))
    }

    fn read_latest_pointer(&self, key: &LogicalKey) -> Option<String> {
        let data = fs::read_to_string(self.latest_path(key)).ok()?;
        let id = data.trim();
        if id.is_empty() {
            None
        } else {
            Some(id.to_string())
        }
    }

    /// Swap the pointer via temp-file rename so readers never observe a
    /// partially written id.
    fn write_latest_pointer(&self, key: &LogicalKey, id: &str) -> Result<()> {
        let path = self.latest_path(key);
        let parent = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
        tmp.write_all(id.as_bytes())?;
        tmp.persist(&path)?;
        Ok(())
    }

    /// Compute the canonical path for an event id.
    fn event_path(&self, id: &str) -> PathBuf {
        let sub1 = &id[0..2];
        let sub2 = &id[2..4];
        self.root
            .join("events")
            .join(sub1)
            .join(sub2)
            .join(format!("{}.json", id))
    }

    fn load_event(&self, id: &str) -> Option<Event> {
        if !id_fits_on_disk(id) {
            return None;
        }
        let data = fs::read_to_string(self.event_path(id)).ok()?;
        serde_json::from_str(&data).ok()
    }

    /// Union of id sets for a list of keys under `prefix`.
    fn load_ids(&self, prefix: &str, keys: &[String]) -> Result<HashSet<String>> {
        let mut ids = HashSet::new();
        for key in keys {
            let path = self
                .root
                .join(prefix)
                .join(format!("{}.txt", safe_component(key)));
            ids.extend(read_ids(&path)?);
        }
        Ok(ids)
    }
}

/// An id only gets a canonical path when it is long enough for the shard
/// prefix and pure ASCII, so the prefix slices in [`Store::event_path`]
/// always land on char boundaries.
fn id_fits_on_disk(id: &str) -> bool {
    id.len() >= 4 && id.is_ascii()
}

/// Make a free-form value usable as a file name component.
fn safe_component(name: &str) -> String {
    if name.is_empty() {
        return "_".into();
    }
    name.replace(['/', '\\', '\0'], "_")
}

/// Read newline-separated ids from a text file.
fn read_ids(path: &Path) -> Result<HashSet<String>> {
    if !path.exists() {
        return Ok(Default::default());
    }
    let data = fs::read_to_string(path)?;
    Ok(data.lines().map(|s| s.to_string()).collect())
}

//! Domain entities parsed from raw catalog events.
//!
//! Parsing is the trust boundary: anything that does not conform to the
//! expected shape (missing `d` tag, malformed address reference, encrypted
//! stack payload) is dropped here so downstream code can assume validity.

use serde::Serialize;
use serde_json::Value;

use crate::event::Event;

/// Kind 0: user metadata.
pub const KIND_PROFILE: u32 = 0;
/// Kind 30063: software release, references its app with an `a` tag.
pub const KIND_RELEASE: u32 = 30063;
/// Kind 30267: author-curated set of apps.
pub const KIND_APP_STACK: u32 = 30267;
/// Kind 32267: software application metadata.
pub const KIND_APP: u32 = 32267;

/// Address reference `32267:<pubkey>:<identifier>` linking a release to its app.
pub fn app_address(pubkey: &str, identifier: &str) -> String {
    format!("{KIND_APP}:{pubkey}:{identifier}")
}

/// An application listing, identified by `(pubkey, d_tag)`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct App {
    pub pubkey: String,
    pub d_tag: String,
    pub name: String,
    pub summary: Option<String>,
    pub icon: Option<String>,
    pub url: Option<String>,
    pub repository: Option<String>,
    /// Long description (event content).
    pub description: String,
    /// All `f` tag values.
    pub platforms: Vec<String>,
    pub created_at: u64,
    pub event: Event,
}

/// Parse an app event. Returns `None` for wrong kinds or a missing `d` tag.
pub fn parse_app(ev: &Event) -> Option<App> {
    if ev.kind != KIND_APP {
        return None;
    }
    let d_tag = ev.first_tag_value("d")?.to_string();
    let name = ev
        .first_tag_value("name")
        .map(String::from)
        .unwrap_or_else(|| d_tag.clone());
    Some(App {
        pubkey: ev.pubkey.clone(),
        name,
        summary: ev.first_tag_value("summary").map(String::from),
        icon: ev.first_tag_value("icon").map(String::from),
        url: ev.first_tag_value("url").map(String::from),
        repository: ev.first_tag_value("repository").map(String::from),
        description: ev.content.clone(),
        platforms: ev.tag_values("f").iter().map(|s| s.to_string()).collect(),
        created_at: ev.created_at,
        d_tag,
        event: ev.clone(),
    })
}

/// A release of an app. `created_at` is the global ranking key for
/// "apps by latest release".
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Release {
    pub pubkey: String,
    /// App identifier this release belongs to.
    pub identifier: String,
    /// Version suffix of the `d` tag, when present.
    pub version: Option<String>,
    pub url: Option<String>,
    pub created_at: u64,
    pub event: Event,
}

/// Derive the app identifier a release points at: an explicit `i` tag wins,
/// otherwise the prefix of the release's own `d` tag split on `@`.
pub fn release_identifier(ev: &Event) -> Option<String> {
    if let Some(i_tag) = ev.first_tag_value("i") {
        if !i_tag.is_empty() {
            return Some(i_tag.to_string());
        }
    }
    let d_tag = ev.first_tag_value("d")?;
    let identifier = d_tag.split('@').next().unwrap_or("");
    if identifier.is_empty() {
        None
    } else {
        Some(identifier.to_string())
    }
}

/// Parse a release event. Returns `None` when no identifier can be derived.
pub fn parse_release(ev: &Event) -> Option<Release> {
    if ev.kind != KIND_RELEASE {
        return None;
    }
    let identifier = release_identifier(ev)?;
    let version = ev
        .first_tag_value("d")
        .and_then(|d| d.split_once('@'))
        .map(|(_, v)| v.to_string());
    Some(Release {
        pubkey: ev.pubkey.clone(),
        identifier,
        version,
        url: ev.first_tag_value("url").map(String::from),
        created_at: ev.created_at,
        event: ev.clone(),
    })
}

/// Pointer from a stack to a member app.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, Hash)]
pub struct AppRef {
    pub kind: u32,
    pub pubkey: String,
    pub identifier: String,
}

impl AppRef {
    /// Parse an `a` tag value `kind:pubkey:identifier`.
    fn parse(value: &str) -> Option<Self> {
        let mut parts = value.splitn(3, ':');
        let kind = parts.next()?.parse().ok()?;
        let pubkey = parts.next()?.to_string();
        let identifier = parts.next()?.to_string();
        if pubkey.is_empty() || identifier.is_empty() {
            return None;
        }
        Some(AppRef {
            kind,
            pubkey,
            identifier,
        })
    }
}

/// An author-curated, ordered collection of apps.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AppStack {
    pub pubkey: String,
    pub d_tag: String,
    pub title: String,
    pub description: Option<String>,
    pub image: Option<String>,
    /// Member references in curation order; only app-kind refs are kept.
    pub app_refs: Vec<AppRef>,
    pub created_at: u64,
    pub event: Event,
}

/// Parse a stack event. A non-empty `content` marks an encrypted/private set
/// and is rejected, as is a missing `d` tag.
pub fn parse_app_stack(ev: &Event) -> Option<AppStack> {
    if ev.kind != KIND_APP_STACK || !ev.content.is_empty() {
        return None;
    }
    let d_tag = ev.first_tag_value("d")?.to_string();
    let title = ev
        .first_tag_value("title")
        .or_else(|| ev.first_tag_value("name"))
        .map(String::from)
        .unwrap_or_else(|| d_tag.clone());
    let app_refs = ev
        .tag_values("a")
        .iter()
        .filter_map(|v| AppRef::parse(v))
        .filter(|r| r.kind == KIND_APP)
        .collect();
    Some(AppStack {
        pubkey: ev.pubkey.clone(),
        title,
        description: ev.first_tag_value("description").map(String::from),
        image: ev.first_tag_value("image").map(String::from),
        app_refs,
        created_at: ev.created_at,
        d_tag,
        event: ev.clone(),
    })
}

/// User profile metadata (kind 0 content).
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Profile {
    pub pubkey: String,
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub picture: Option<String>,
    /// Lightning address.
    pub lud16: Option<String>,
    pub created_at: u64,
}

impl Profile {
    /// Preferred human-readable name.
    pub fn best_name(&self) -> Option<&str> {
        self.display_name.as_deref().or(self.name.as_deref())
    }
}

/// Parse a profile event. Malformed JSON content yields an empty profile
/// rather than an error.
pub fn parse_profile(ev: &Event) -> Profile {
    let meta: Value = serde_json::from_str(&ev.content).unwrap_or(Value::Null);
    let field = |name: &str| {
        meta.get(name)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(String::from)
    };
    Profile {
        pubkey: ev.pubkey.clone(),
        name: field("name"),
        display_name: field("display_name"),
        picture: field("picture"),
        lud16: field("lud16"),
        created_at: ev.created_at,
    }
}

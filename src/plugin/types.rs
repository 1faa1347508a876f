//! Runner capability contract and the payload shapes exchanged with runners
//!
//! Everything here crosses the plugin boundary as camelCase JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::core::error::{BridgeError, Result};

/// Unique identifier of a loaded runner
pub type RunnerId = String;

/// Identity block a runner exposes as `RUNNER.info`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerDescriptor {
    pub id: RunnerId,
    pub name: String,
    pub version: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_supported_host_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

impl RunnerDescriptor {
    /// Check the runner's minimum host version against `host_version`
    ///
    /// Runners without a minimum are always supported.
    pub fn supports_host(&self, host_version: &str) -> Result<bool> {
        let Some(minimum) = &self.min_supported_host_version else {
            return Ok(true);
        };

        let host = semver::Version::parse(host_version)
            .map_err(|e| BridgeError::Validation(format!("Invalid host version {}: {}", host_version, e)))?;
        let required = parse_lenient_version(minimum).ok_or_else(|| {
            BridgeError::PluginLoad(format!(
                "Runner {} declares an invalid minimum host version: {}",
                self.id, minimum
            ))
        })?;

        Ok(host >= required)
    }
}

/// Accepts `1`, `1.4` and `1.4.0`
fn parse_lenient_version(raw: &str) -> Option<semver::Version> {
    let raw = raw.trim();
    let padded = match raw.matches('.').count() {
        0 => format!("{}.0.0", raw),
        1 => format!("{}.0", raw),
        _ => raw.to_string(),
    };
    semver::Version::parse(&padded).ok()
}

/// How a runner authenticates its users
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthenticationMethod {
    Webview,
    Basic,
    Oauth,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Label shown above the identifier field of a basic-auth form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum BasicAuthLabel {
    Email,
    Username,
}

impl TryFrom<u8> for BasicAuthLabel {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(BasicAuthLabel::Email),
            1 => Ok(BasicAuthLabel::Username),
            other => Err(format!("unknown basic auth label {}", other)),
        }
    }
}

impl From<BasicAuthLabel> for u8 {
    fn from(label: BasicAuthLabel) -> Self {
        match label {
            BasicAuthLabel::Email => 0,
            BasicAuthLabel::Username => 1,
        }
    }
}

/// Feature flags a runner advertises once at load time
///
/// Missing flags are treated as `false`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerIntents {
    pub preference_menu_builder: bool,
    pub authenticatable: bool,
    pub authentication_method: AuthenticationMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub basic_auth_label: Option<BasicAuthLabel>,
    pub image_request_handler: bool,
    pub page_link_resolver: bool,
    pub library_page_link_provider: bool,
    pub browse_page_link_provider: bool,
    pub chapter_event_handler: bool,
    pub content_event_handler: bool,
    pub chapter_sync_handler: bool,
    pub library_sync_handler: bool,
    pub has_tags_view: bool,
    pub page_read_handler: bool,
    pub provides_reader_context: bool,
    pub can_refresh_highlight: bool,
    pub is_context_menu_provider: bool,
    pub advanced_tracker: bool,
}

/// Optional config block a runner ships next to its info
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(flatten)]
    pub values: Map<String, Value>,
}

impl RunnerConfig {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}

/// Everything a transport learns about a runner when it loads it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerProfile {
    #[serde(rename = "info")]
    pub descriptor: RunnerDescriptor,
    #[serde(default)]
    pub intents: RunnerIntents,
    #[serde(default)]
    pub config: Option<RunnerConfig>,
}

/// Result of the page `prepare(info)` handshake call
#[derive(Debug, Clone, Deserialize)]
pub struct PreparedInfo {
    #[serde(flatten)]
    pub descriptor: RunnerDescriptor,
    #[serde(default)]
    pub config: Option<RunnerConfig>,
}

// ---------------------------------------------------------------------------
// Directory

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub page: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<TagReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagReference {
    pub tag_id: String,
    pub property_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PagedResult<T> {
    pub results: Vec<T>,
    #[serde(default)]
    pub is_last_page: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_result_count: Option<u64>,
}

/// Catalog entry as listed by directories and page sections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Highlight {
    pub id: String,
    pub title: String,
    pub cover: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<PageLink>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Vec<DirectoryFilter>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<SortOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_disabled: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryFilter {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<SelectOption>>,
}

/// A selectable option of a filter or preference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectOption {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortOptions {
    pub options: Vec<SelectOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub can_change_order: bool,
}

// ---------------------------------------------------------------------------
// Authentication

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub handle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicUrl {
    pub url: String,
}

impl BasicUrl {
    pub fn parse(&self) -> Result<url::Url> {
        url::Url::parse(&self.url)
            .map_err(|e| BridgeError::Validation(format!("Runner returned invalid URL {}: {}", self.url, e)))
    }
}

// ---------------------------------------------------------------------------
// Requests and links

/// HTTP request a runner wants the host to issue, e.g. for an image
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRequest {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookies: Option<Vec<Cookie>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageLink {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageLinkLabel {
    pub title: String,
    pub link: PageLink,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageSection {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    /// Absent when the section must be resolved separately
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<Highlight>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedPageSection {
    pub items: Vec<Highlight>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_subtitle: Option<String>,
}

// ---------------------------------------------------------------------------
// Preferences

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferenceGroup {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer: Option<String>,
    pub children: Vec<Preference>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preference {
    pub key: String,
    pub label: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<SelectOption>>,
}

// ---------------------------------------------------------------------------
// Content

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    pub title: String,
    pub cover: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_titles: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Vec<Property>>,
    /// Some runners return chapters inline with the content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapters: Option<Vec<Chapter>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    pub chapter_id: String,
    pub number: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    /// Position in the runner's listing, newest first
    #[serde(default)]
    pub index: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChapterData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages: Option<Vec<ChapterPage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterPage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub id: String,
    pub label: String,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nsfw: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

// ---------------------------------------------------------------------------
// Tracking

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackItem {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<TrackEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackEntry {
    pub progress: TrackProgress,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackProgress {
    #[serde(default)]
    pub last_read_chapter: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read_volume: Option<f64>,
}

impl TrackItem {
    pub fn last_read_chapter(&self) -> f64 {
        self.entry.as_ref().map_or(0.0, |e| e.progress.last_read_chapter)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackProgressUpdate {
    pub chapter: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
}

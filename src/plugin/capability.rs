//! Intent-guarded call sites

use std::fmt;

use super::types::{AuthenticationMethod, RunnerIntents};
use crate::core::error::{BridgeError, Result};

/// Optional features a runner may advertise through its intents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    PreferenceMenu,
    Authentication,
    BasicAuthentication,
    WebviewAuthentication,
    OAuthAuthentication,
    ImageRequestInterception,
    PageLinkResolution,
    LibraryPageLinks,
    BrowsePageLinks,
    ChapterEvents,
    ContentEvents,
    ChapterSync,
    LibrarySync,
    TagsView,
    PageReadEvents,
    ReaderContext,
    HighlightRefresh,
    ContextMenu,
    Tracking,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::PreferenceMenu => "preferenceMenuBuilder",
            Capability::Authentication => "authenticatable",
            Capability::BasicAuthentication => "authenticationMethod=basic",
            Capability::WebviewAuthentication => "authenticationMethod=webview",
            Capability::OAuthAuthentication => "authenticationMethod=oauth",
            Capability::ImageRequestInterception => "imageRequestHandler",
            Capability::PageLinkResolution => "pageLinkResolver",
            Capability::LibraryPageLinks => "libraryPageLinkProvider",
            Capability::BrowsePageLinks => "browsePageLinkProvider",
            Capability::ChapterEvents => "chapterEventHandler",
            Capability::ContentEvents => "contentEventHandler",
            Capability::ChapterSync => "chapterSyncHandler",
            Capability::LibrarySync => "librarySyncHandler",
            Capability::TagsView => "hasTagsView",
            Capability::PageReadEvents => "pageReadHandler",
            Capability::ReaderContext => "providesReaderContext",
            Capability::HighlightRefresh => "canRefreshHighlight",
            Capability::ContextMenu => "isContextMenuProvider",
            Capability::Tracking => "advancedTracker",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RunnerIntents {
    /// Whether the runner advertised `capability`
    pub fn supports(&self, capability: Capability) -> bool {
        let auth_via = |method| self.authenticatable && self.authentication_method == method;
        match capability {
            Capability::PreferenceMenu => self.preference_menu_builder,
            Capability::Authentication => self.authenticatable,
            Capability::BasicAuthentication => auth_via(AuthenticationMethod::Basic),
            Capability::WebviewAuthentication => auth_via(AuthenticationMethod::Webview),
            Capability::OAuthAuthentication => auth_via(AuthenticationMethod::Oauth),
            Capability::ImageRequestInterception => self.image_request_handler,
            Capability::PageLinkResolution => self.page_link_resolver,
            Capability::LibraryPageLinks => self.library_page_link_provider,
            Capability::BrowsePageLinks => self.browse_page_link_provider,
            Capability::ChapterEvents => self.chapter_event_handler,
            Capability::ContentEvents => self.content_event_handler,
            Capability::ChapterSync => self.chapter_sync_handler,
            Capability::LibrarySync => self.library_sync_handler,
            Capability::TagsView => self.has_tags_view,
            Capability::PageReadEvents => self.page_read_handler,
            Capability::ReaderContext => self.provides_reader_context,
            Capability::HighlightRefresh => self.can_refresh_highlight,
            Capability::ContextMenu => self.is_context_menu_provider,
            Capability::Tracking => self.advanced_tracker,
        }
    }

    /// Reject the call site unless `capability` is advertised
    pub fn require(&self, runner: &str, capability: Capability) -> Result<()> {
        if self.supports(capability) {
            Ok(())
        } else {
            Err(BridgeError::CapabilityDisabled {
                runner: runner.to_string(),
                capability: capability.to_string(),
            })
        }
    }
}

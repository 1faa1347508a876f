//! The transport-agnostic runner handle the application calls
//!
//! Every operation routes through "ensure ready", and every optional call
//! site is checked against the runner's intents before anything reaches the
//! dispatcher.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::capability::Capability;
use super::context::{RunnerContext, Transport};
use super::dispatcher::MethodDispatcher;
use super::types::{
    BasicUrl, Chapter, ChapterData, Content, DirectoryConfig, DirectoryRequest, Highlight,
    ImageRequest, PageLink, PageLinkLabel, PageSection, PagedResult, PreferenceGroup,
    ResolvedPageSection, RunnerDescriptor, RunnerId, RunnerIntents, RunnerProfile, TrackItem,
    TrackProgressUpdate, User,
};
use crate::cache::DirectoryConfigCache;
use crate::core::error::{BridgeError, Result};

/// Opens a fresh context for a runner, on first load and on every reload
#[async_trait]
pub trait ContextFactory: Send + Sync {
    async fn open(&self) -> Result<(Arc<dyn RunnerContext>, RunnerProfile)>;
}

/// One loaded instance: its profile, dispatcher and cache live and die together
struct LoadedRunner {
    profile: RunnerProfile,
    dispatcher: MethodDispatcher,
    directory_configs: DirectoryConfigCache,
}

pub struct RunnerHandle {
    id: RunnerId,
    factory: Box<dyn ContextFactory>,
    call_timeout: Option<Duration>,
    loaded: RwLock<Arc<LoadedRunner>>,
    reloading: Mutex<()>,
}

impl RunnerHandle {
    /// Open the runner and check it supports this host
    pub async fn open(factory: Box<dyn ContextFactory>, call_timeout: Option<Duration>) -> Result<Self> {
        let loaded = Self::load(factory.as_ref(), call_timeout).await?;
        Ok(Self {
            id: loaded.profile.descriptor.id.clone(),
            factory,
            call_timeout,
            loaded: RwLock::new(Arc::new(loaded)),
            reloading: Mutex::new(()),
        })
    }

    async fn load(factory: &dyn ContextFactory, call_timeout: Option<Duration>) -> Result<LoadedRunner> {
        let (context, profile) = factory.open().await?;
        let descriptor = &profile.descriptor;

        let supported = descriptor.supports_host(crate::VERSION);
        if !matches!(supported, Ok(true)) {
            context.shutdown().await?;
            return Err(match supported {
                Err(e) => e,
                _ => BridgeError::PluginLoad(format!(
                    "{} requires host version {} (running {})",
                    descriptor.id,
                    descriptor.min_supported_host_version.as_deref().unwrap_or_default(),
                    crate::VERSION
                )),
            });
        }

        Ok(LoadedRunner {
            dispatcher: MethodDispatcher::new(descriptor.id.clone(), context, call_timeout),
            profile,
            directory_configs: DirectoryConfigCache::new(),
        })
    }

    fn current(&self) -> Arc<LoadedRunner> {
        Arc::clone(&self.loaded.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn descriptor(&self) -> RunnerDescriptor {
        self.current().profile.descriptor.clone()
    }

    pub fn intents(&self) -> RunnerIntents {
        self.current().profile.intents.clone()
    }

    pub fn profile(&self) -> RunnerProfile {
        self.current().profile.clone()
    }

    pub fn transport(&self) -> Transport {
        self.current().dispatcher.context().transport()
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.current().profile.intents.supports(capability)
    }

    /// Replace the loaded instance with a fresh one from the same bundle
    ///
    /// The old context is shut down and its directory configs are dropped.
    pub async fn reload(&self) -> Result<()> {
        let _reloading = self.reloading.lock().await;
        let fresh = Self::load(self.factory.as_ref(), self.call_timeout).await?;

        if fresh.profile.descriptor.id != self.id {
            let reloaded_as = fresh.profile.descriptor.id.clone();
            fresh.dispatcher.context().shutdown().await?;
            return Err(BridgeError::PluginLoad(format!(
                "{} changed its id to {} on reload",
                self.id, reloaded_as
            )));
        }

        let previous = {
            let mut loaded = self.loaded.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *loaded, Arc::new(fresh))
        };
        previous.directory_configs.clear().await;
        previous.dispatcher.context().shutdown().await?;

        info!(runner = %self.id, version = self.descriptor().version, "Runner reloaded");
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        let loaded = self.current();
        loaded.directory_configs.clear().await;
        loaded.dispatcher.context().shutdown().await
    }

    async fn ready(&self) -> Result<Arc<LoadedRunner>> {
        let loaded = self.current();
        loaded.dispatcher.context().ensure_ready().await?;
        Ok(loaded)
    }

    /// Intents first, then readiness
    async fn guarded(&self, capability: Capability) -> Result<Arc<LoadedRunner>> {
        let loaded = self.current();
        loaded.profile.intents.require(&self.id, capability)?;
        loaded.dispatcher.context().ensure_ready().await?;
        Ok(loaded)
    }

    // -- Directory --------------------------------------------------------

    pub async fn get_directory(&self, request: &DirectoryRequest) -> Result<PagedResult<Highlight>> {
        let loaded = self.ready().await?;
        loaded.dispatcher.call_returning("getDirectory", &[json!(request)]).await
    }

    /// Cached per key until the runner is reloaded
    pub async fn get_directory_config(&self, key: Option<&str>) -> Result<DirectoryConfig> {
        let loaded = self.ready().await?;
        let dispatcher = &loaded.dispatcher;
        loaded
            .directory_configs
            .get_or_fetch(key, || async move {
                debug!(runner = %self.id, key = ?key, "Fetching directory config");
                dispatcher.call_returning("getDirectoryConfig", &[json!(key)]).await
            })
            .await
    }

    // -- Authentication ---------------------------------------------------

    pub async fn get_authenticated_user(&self) -> Result<Option<User>> {
        let loaded = self.guarded(Capability::Authentication).await?;
        loaded.dispatcher.call_optional("getAuthenticatedUser", &[]).await
    }

    pub async fn handle_user_sign_out(&self) -> Result<()> {
        let loaded = self.guarded(Capability::Authentication).await?;
        loaded.dispatcher.call_void("handleUserSignOut", &[]).await
    }

    pub async fn handle_basic_auth(&self, identifier: &str, password: &str) -> Result<()> {
        let loaded = self.guarded(Capability::BasicAuthentication).await?;
        loaded
            .dispatcher
            .call_void("handleBasicAuth", &[json!(identifier), json!(password)])
            .await
    }

    pub async fn get_web_auth_request_url(&self) -> Result<BasicUrl> {
        let loaded = self.guarded(Capability::WebviewAuthentication).await?;
        loaded.dispatcher.call_returning("getWebAuthRequestURL", &[]).await
    }

    /// Whether the named session cookie completes the web login
    pub async fn did_receive_session_cookie(&self, name: &str) -> Result<bool> {
        let loaded = self.guarded(Capability::WebviewAuthentication).await?;
        loaded
            .dispatcher
            .call_returning("didReceiveSessionCookieFromWebAuthResponse", &[json!(name)])
            .await
    }

    pub async fn get_oauth_request_url(&self) -> Result<BasicUrl> {
        let loaded = self.guarded(Capability::OAuthAuthentication).await?;
        loaded.dispatcher.call_returning("getOAuthRequestURL", &[]).await
    }

    pub async fn handle_oauth_callback(&self, response: &str) -> Result<()> {
        let loaded = self.guarded(Capability::OAuthAuthentication).await?;
        loaded.dispatcher.call_void("handleOAuthCallback", &[json!(response)]).await
    }

    // -- Pages and images -------------------------------------------------

    pub async fn will_request_image(&self, url: &url::Url) -> Result<ImageRequest> {
        let loaded = self.guarded(Capability::ImageRequestInterception).await?;
        loaded.dispatcher.call_returning("willRequestImage", &[json!(url.as_str())]).await
    }

    pub async fn get_sections_for_page(&self, link: &PageLink) -> Result<Vec<PageSection>> {
        let loaded = self.guarded(Capability::PageLinkResolution).await?;
        loaded.dispatcher.call_returning("getSectionsForPage", &[json!(link)]).await
    }

    pub async fn will_resolve_sections_for_page(&self, link: &PageLink) -> Result<()> {
        let loaded = self.guarded(Capability::PageLinkResolution).await?;
        loaded.dispatcher.call_void("willResolveSectionsForPage", &[json!(link)]).await
    }

    pub async fn resolve_page_section(&self, link: &PageLink, section: &str) -> Result<ResolvedPageSection> {
        let loaded = self.guarded(Capability::PageLinkResolution).await?;
        loaded
            .dispatcher
            .call_returning("resolvePageSection", &[json!(link), json!(section)])
            .await
    }

    pub async fn get_library_page_links(&self) -> Result<Vec<PageLinkLabel>> {
        let loaded = self.guarded(Capability::LibraryPageLinks).await?;
        loaded.dispatcher.call_returning("getLibraryPageLinks", &[]).await
    }

    pub async fn get_browse_page_links(&self) -> Result<Vec<PageLinkLabel>> {
        let loaded = self.guarded(Capability::BrowsePageLinks).await?;
        loaded.dispatcher.call_returning("getBrowsePageLinks", &[]).await
    }

    // -- Preferences ------------------------------------------------------

    pub async fn build_preference_menu(&self) -> Result<Vec<PreferenceGroup>> {
        let loaded = self.guarded(Capability::PreferenceMenu).await?;
        loaded.dispatcher.call_context("generatePreferenceMenu", &[]).await
    }

    /// Push a preference change; runner failures are logged, not returned
    pub async fn update_preference(&self, key: &str, value: Value) -> Result<()> {
        let loaded = self.guarded(Capability::PreferenceMenu).await?;
        match loaded
            .dispatcher
            .call_context_void("updateSourcePreferences", &[json!(key), value])
            .await
        {
            Ok(()) => debug!(runner = %self.id, key = %key, "Preference updated"),
            Err(e) => warn!(runner = %self.id, key = %key, "Preference failed to update: {}", e),
        }
        Ok(())
    }

    // -- Content ----------------------------------------------------------

    pub async fn get_content(&self, content_id: &str) -> Result<Content> {
        let loaded = self.ready().await?;
        loaded.dispatcher.call_returning("getContent", &[json!(content_id)]).await
    }

    pub async fn get_chapters(&self, content_id: &str) -> Result<Vec<Chapter>> {
        let loaded = self.ready().await?;
        loaded.dispatcher.call_returning("getChapters", &[json!(content_id)]).await
    }

    pub async fn get_chapter_data(&self, content_id: &str, chapter_id: &str) -> Result<ChapterData> {
        let loaded = self.ready().await?;
        loaded
            .dispatcher
            .call_returning("getChapterData", &[json!(content_id), json!(chapter_id)])
            .await
    }

    pub async fn on_chapter_read(&self, content_id: &str, chapter_id: &str) -> Result<()> {
        let loaded = self.guarded(Capability::ChapterEvents).await?;
        loaded
            .dispatcher
            .call_void("onChapterRead", &[json!(content_id), json!(chapter_id)])
            .await
    }

    /// Chapter ids the runner's own service reports as read
    pub async fn get_read_chapter_markers(&self, content_id: &str) -> Result<Vec<String>> {
        let loaded = self.guarded(Capability::ChapterSync).await?;
        loaded
            .dispatcher
            .call_returning("getReadChapterMarkers", &[json!(content_id)])
            .await
    }

    // -- Tracking ---------------------------------------------------------

    pub async fn get_track_item(&self, id: &str) -> Result<TrackItem> {
        let loaded = self.guarded(Capability::Tracking).await?;
        loaded.dispatcher.call_returning("getTrackItem", &[json!(id)]).await
    }

    pub async fn did_update_last_read_chapter(&self, id: &str, progress: &TrackProgressUpdate) -> Result<()> {
        let loaded = self.guarded(Capability::Tracking).await?;
        loaded
            .dispatcher
            .call_void("didUpdateLastReadChapter", &[json!(id), json!(progress)])
            .await
    }

    // -- Untyped ----------------------------------------------------------

    /// Call any runner method and decode its result
    pub async fn call_returning<T: DeserializeOwned>(&self, method: &str, args: &[Value]) -> Result<T> {
        let loaded = self.ready().await?;
        loaded.dispatcher.call_returning(method, args).await
    }

    /// Call a runner method without suspension; direct contexts only
    pub fn call_synchronous<T: DeserializeOwned>(&self, method: &str, args: &[Value]) -> Result<T> {
        self.current().dispatcher.call_synchronous(method, args)
    }
}

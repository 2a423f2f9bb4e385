//! The display adapter: what one on-screen image should show, and when.
//!
//! An [ImageView] walks `Placeholder -> Thumbnail -> Loaded`, or ends in `Fallback`/`Error` when the cache can't
//! help.  Views that aren't priority wait for [ImageView::mark_visible] before touching the network.  Everything the
//! view is displaying is held through [Lease]s, which the view gives back when it is dropped, when it falls back, or
//! when a sharper image replaces the thumbnail.
//!
//! Changing the key of a view is dropping it and mounting another one.
use std::fmt;
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::*;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisplayRequest {
    /// A raw path such as `/abc.jpg`, or a full URL.
    pub source: String,
    /// Width of the container in pixels.  Picks the final tier.
    pub width: Option<u32>,
    /// Load straight away instead of waiting to become visible.
    pub priority: bool,
}

impl DisplayRequest {
    pub fn new(source: impl Into<String>) -> DisplayRequest {
        DisplayRequest {
            source: source.into(),
            width: None,
            priority: false,
        }
    }

    pub fn width(mut self, width: u32) -> DisplayRequest {
        self.width = Some(width);
        self
    }

    pub fn priority(mut self, priority: bool) -> DisplayRequest {
        self.priority = priority;
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum DisplayState {
    Placeholder,
    /// The low-resolution preview is showing.
    Thumbnail(ObjectHandle),
    Loaded(ObjectHandle),
    /// Show this URL directly, bypassing the cache.
    Fallback(String),
    Error,
}

impl DisplayState {
    /// The cached object to render, if any.
    pub fn handle(&self) -> Option<&ObjectHandle> {
        match self {
            DisplayState::Thumbnail(x) | DisplayState::Loaded(x) => Some(x),
            _ => None,
        }
    }
}

/// A muted color to fill the frame with before anything has loaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlaceholderColor {
    pub hue: u16,
    pub saturation: u8,
    pub lightness: u8,
}

impl PlaceholderColor {
    /// Used when there is no path to derive a color from.
    pub const NEUTRAL: PlaceholderColor = PlaceholderColor {
        hue: 0,
        saturation: 0,
        lightness: 20,
    };
}

impl fmt::Display for PlaceholderColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hsl({}, {}%, {}%)", self.hue, self.saturation, self.lightness)
    }
}

/// Derive a placeholder color from an image path.  The same path always gets the same color.
pub fn placeholder_color(path: &str) -> PlaceholderColor {
    // A string hash over UTF-16 units where the shift wraps at 32 bits but the running sum doesn't.
    let mut hash: i64 = 0;
    for unit in path.encode_utf16() {
        let shifted = (hash as i32).wrapping_shl(5) as i64;
        hash = unit as i64 + (shifted - hash);
    }
    let low = hash as i32;

    PlaceholderColor {
        hue: (hash % 360).unsigned_abs() as u16,
        saturation: 15 + ((low >> 8).unsigned_abs() % 20) as u8,
        lightness: 15 + ((low >> 16).unsigned_abs() % 15) as u8,
    }
}

#[derive(Default)]
struct ViewLeases {
    /// Set once the view stops caring.  A loader that sees it drops whatever it got.
    closed: bool,
    thumbnail: Option<Lease>,
    full: Option<Lease>,
}

/// One displayed image.
///
/// Dropping the view releases everything it holds.
pub struct ImageView {
    cache: ArtworkCache,
    path: Option<String>,
    thumbnail_key: Option<ResourceKey>,
    final_key: Option<ResourceKey>,
    /// The direct URL to show when the cache can't help.
    fallback_url: String,
    state: Arc<watch::Sender<DisplayState>>,
    receiver: watch::Receiver<DisplayState>,
    leases: Arc<Mutex<ViewLeases>>,
    loader: Option<JoinHandle<()>>,
    was_fully_loaded: bool,
}

impl ArtworkCache {
    /// Mount a view for one image.
    ///
    /// The initial state is worked out synchronously from the memory tier, so an image that is already cached never
    /// flashes a placeholder.  Must be called from within a Tokio runtime.
    pub fn display(&self, request: DisplayRequest) -> ImageView {
        ImageView::mount(self.clone(), request)
    }
}

impl ImageView {
    fn mount(cache: ArtworkCache, request: DisplayRequest) -> ImageView {
        let path = cache
            .keys()
            .path_from_source(&request.source)
            .map(str::to_string);

        let (thumbnail_key, final_key) = match &path {
            Some(p) => {
                let config = cache.config();
                let tier = match request.width {
                    Some(w) => optimal_tier(w),
                    None => config.default_tier.as_str(),
                };
                let thumbnail_key = if tier == config.thumbnail_tier {
                    None
                } else {
                    cache.build_key(p, &config.thumbnail_tier)
                };
                (thumbnail_key, cache.build_key(p, tier))
            }
            None => (None, None),
        };

        let was_fully_loaded = path.as_deref().is_some_and(|p| cache.was_fully_loaded(p));
        let fallback_url = final_key
            .as_ref()
            .map_or_else(|| request.source.clone(), |k| k.to_string());

        let mut leases = ViewLeases::default();
        let initial = match &final_key {
            None if request.source.trim().is_empty() => DisplayState::Error,
            None => DisplayState::Fallback(request.source.clone()),
            Some(key) => {
                let dedup = cache.deduplicator();
                if let Some(lease) = dedup.acquire_cached(key) {
                    let handle = lease.handle().clone();
                    leases.full = Some(lease);
                    DisplayState::Loaded(handle)
                } else if let Some(lease) = thumbnail_key.as_ref().and_then(|k| dedup.acquire_cached(k)) {
                    let handle = lease.handle().clone();
                    leases.thumbnail = Some(lease);
                    DisplayState::Thumbnail(handle)
                } else {
                    DisplayState::Placeholder
                }
            }
        };
        trace!("Mounted {:?} as {:?}", request.source, initial);

        if let (DisplayState::Loaded(_), Some(p)) = (&initial, &path) {
            cache.mark_fully_loaded(p);
        }

        let (state, receiver) = watch::channel(initial);
        let mut view = ImageView {
            cache,
            path,
            thumbnail_key,
            final_key,
            fallback_url,
            state: Arc::new(state),
            receiver,
            leases: Arc::new(Mutex::new(leases)),
            loader: None,
            was_fully_loaded,
        };

        // A path seen in full earlier this session loads without waiting to be visible.
        if request.priority || was_fully_loaded {
            view.start();
        }
        view
    }

    pub fn state(&self) -> DisplayState {
        self.receiver.borrow().clone()
    }

    /// Another receiver for the view's state.
    pub fn subscribe(&self) -> watch::Receiver<DisplayState> {
        self.receiver.clone()
    }

    /// Wait for the state to change.  Returns false once the view can no longer change.
    pub async fn changed(&mut self) -> bool {
        self.receiver.changed().await.is_ok()
    }

    /// Wait until the state satisfies `f`, and return it.
    pub async fn wait_for(&mut self, f: impl FnMut(&DisplayState) -> bool) -> Option<DisplayState> {
        self.receiver.wait_for(f).await.ok().map(|x| (*x).clone())
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn thumbnail_key(&self) -> Option<&ResourceKey> {
        self.thumbnail_key.as_ref()
    }

    pub fn final_key(&self) -> Option<&ResourceKey> {
        self.final_key.as_ref()
    }

    /// Had this path been displayed in full earlier in the session when the view was mounted?
    pub fn was_fully_loaded(&self) -> bool {
        self.was_fully_loaded
    }

    pub fn placeholder_color(&self) -> PlaceholderColor {
        self.path
            .as_deref()
            .map_or(PlaceholderColor::NEUTRAL, placeholder_color)
    }

    /// The view scrolled into (or near) the viewport.  Starts loading if it hasn't already.
    pub fn mark_visible(&mut self) {
        self.start();
    }

    /// Rendering what the view handed out failed.
    ///
    /// A cached image gives way to the direct URL, and a direct URL that fails too becomes an error.  The view stops
    /// loading and releases everything it holds.
    pub fn report_render_error(&mut self) {
        let next = match &*self.state.borrow() {
            DisplayState::Fallback(_) | DisplayState::Error => DisplayState::Error,
            _ => DisplayState::Fallback(self.fallback_url.clone()),
        };
        self.close();
        self.state.send_replace(next);
    }

    fn start(&mut self) {
        if self.loader.is_some() || self.leases.lock().closed {
            return;
        }
        let (Some(path), Some(final_key)) = (&self.path, &self.final_key) else {
            return;
        };
        if !matches!(
            &*self.state.borrow(),
            DisplayState::Placeholder | DisplayState::Thumbnail(_)
        ) {
            return;
        }

        self.loader = Some(tokio::spawn(load(
            self.cache.clone(),
            path.clone(),
            self.thumbnail_key.clone(),
            final_key.clone(),
            self.state.clone(),
            self.leases.clone(),
        )));
    }

    fn close(&mut self) {
        let released = {
            let mut held = self.leases.lock();
            held.closed = true;
            (held.thumbnail.take(), held.full.take())
        };
        drop(released);
        if let Some(task) = self.loader.take() {
            task.abort();
        }
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        self.close();
    }
}

/// Thumbnail, then the final image.  State changes happen under the lease lock, so a closed view never changes again.
async fn load(
    cache: ArtworkCache,
    path: String,
    thumbnail_key: Option<ResourceKey>,
    final_key: ResourceKey,
    state: Arc<watch::Sender<DisplayState>>,
    leases: Arc<Mutex<ViewLeases>>,
) {
    let has_thumbnail = leases.lock().thumbnail.is_some();
    if let (Some(key), false) = (&thumbnail_key, has_thumbnail) {
        if let Some(lease) = cache.acquire(key).await {
            let mut held = leases.lock();
            if held.closed {
                return;
            }
            state.send_replace(DisplayState::Thumbnail(lease.handle().clone()));
            held.thumbnail = Some(lease);
        }
    }

    let lease = cache.acquire(&final_key).await;
    let mut held = leases.lock();
    if held.closed {
        return;
    }
    match lease {
        Some(lease) => {
            state.send_replace(DisplayState::Loaded(lease.handle().clone()));
            held.full = Some(lease);
            held.thumbnail = None;
            drop(held);
            cache.mark_fully_loaded(&path);
        }
        None => {
            trace!("{} didn't resolve, falling back to the direct URL", final_key);
            held.thumbnail = None;
            state.send_replace(DisplayState::Fallback(final_key.to_string()));
        }
    }
}

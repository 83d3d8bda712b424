//! Rendering-surface and media-buffer collaborator contracts.
//!
//! The DOM video element, its container, and the media-source buffer are
//! external to this crate. They are expressed here as traits so the core can
//! be driven identically by a real browser binding layer and by the
//! [`simulation`] implementations used in tests.

pub mod feeder;
pub mod simulation;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

/// CSS marker class applied to the container element for external styling.
pub const CONTAINER_CLASS: &str = "clsp-player-container";

/// CSS marker class applied to the video surface for external styling.
pub const SURFACE_CLASS: &str = "clsp-player";

/// Errors reported by a rendering surface.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SurfaceError {
    /// The surface or media source could not be created
    #[error("Surface creation failed: {reason}")]
    CreationFailed {
        /// Description of the creation failure
        reason: String,
    },

    /// A fullscreen request was denied by the host document
    #[error("Fullscreen request failed: {reason}")]
    Fullscreen {
        /// Description of the fullscreen failure
        reason: String,
    },

    /// The surface's host element is no longer in the document tree
    #[error("Surface detached from document")]
    Detached,
}

/// Errors reported by a media buffer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BufferError {
    /// The browser rejected the append because the buffer is full
    #[error("Media buffer quota exceeded")]
    QuotaExceeded,

    /// The buffer is no longer attached to a surface
    #[error("Media buffer detached")]
    Detached,

    /// Any other append or eviction failure
    #[error("Media buffer operation failed: {reason}")]
    Append {
        /// Description of the failed operation
        reason: String,
    },
}

/// Result type for media buffer operations
pub type BufferResult<T> = Result<T, BufferError>;

/// A media-source buffer attached to a video surface.
///
/// Appends must be sequenced by the caller; the browser-side buffer rejects
/// overlapping operations.
#[async_trait]
pub trait MediaBuffer: Send + Sync {
    /// Appends one fMP4 segment (init or media) to the buffer.
    ///
    /// # Errors
    ///
    /// - `BufferError::QuotaExceeded` - The buffer is full; evict and retry
    /// - `BufferError::Detached` - The surface is gone
    /// - `BufferError::Append` - Any other append failure
    async fn append(&self, segment: Bytes) -> BufferResult<()>;

    /// Returns the currently buffered time ranges as `(start, end)` seconds.
    fn buffered_ranges(&self) -> Vec<(f64, f64)>;

    /// Removes buffered media between `start` and `end` seconds.
    ///
    /// # Errors
    ///
    /// - `BufferError::Detached` - The surface is gone
    /// - `BufferError::Append` - The removal was rejected
    async fn evict(&self, start: f64, end: f64) -> BufferResult<()>;

    /// Watches the count of frames the surface has rendered from this
    /// buffer's media source.
    ///
    /// Frames are attributed to the media source that produced them, so a
    /// player never mistakes a frame of the stream it is replacing for its
    /// own.
    fn frames(&self) -> watch::Receiver<u64>;

    /// Releases the buffer and its media source.
    async fn close(&self);
}

/// One video rendering surface, leased to the current player.
///
/// The surface may be caller-owned (survives session teardown) or
/// session-owned (created inside a container and removed on destroy).
pub trait VideoSurface: Send + Sync {
    /// Adds a CSS class to the surface element.
    fn add_class(&self, class: &str);

    /// Removes a CSS class from the surface element.
    fn remove_class(&self, class: &str);

    /// Mutes or unmutes the surface.
    fn set_muted(&self, muted: bool);

    /// Toggles inline (non-fullscreen) playback on mobile hosts.
    fn set_playsinline(&self, playsinline: bool);

    /// Sets the surface's source to the empty sentinel.
    ///
    /// Required on teardown, before detaching, to release media-buffer
    /// references held by the surface.
    fn clear_source(&self);

    /// Creates a media-source buffer for `mime_codec` and attaches it.
    ///
    /// # Errors
    ///
    /// - `SurfaceError::CreationFailed` - The codec is unsupported or the
    ///   media source could not be opened
    /// - `SurfaceError::Detached` - The surface is gone
    fn attach_media_source(&self, mime_codec: &str) -> Result<Arc<dyn MediaBuffer>, SurfaceError>;

    /// Watches the surface's attachment to the document tree. Flips to
    /// `false` when the host element is removed out-of-band.
    fn attachment(&self) -> watch::Receiver<bool>;

    /// Returns the surface's `(width, height)` once known.
    fn dimensions(&self) -> Option<(u32, u32)>;
}

/// The container element hosting a video surface.
///
/// Fullscreen is requested on the container rather than the surface because
/// the surface is destroyed during every player handoff.
pub trait SurfaceHost: Send + Sync {
    /// Adds a CSS class to the container element.
    fn add_class(&self, class: &str);

    /// Removes a CSS class from the container element.
    fn remove_class(&self, class: &str);

    /// Creates a fresh video surface as a child of this container.
    ///
    /// # Errors
    ///
    /// - `SurfaceError::CreationFailed` - The host document refused the
    ///   element
    fn create_video_surface(&self) -> Result<Arc<dyn VideoSurface>, SurfaceError>;

    /// Detaches a child surface previously created by
    /// [`SurfaceHost::create_video_surface`].
    fn remove_video_surface(&self, surface: &Arc<dyn VideoSurface>);

    /// Requests fullscreen presentation of this container.
    ///
    /// # Errors
    ///
    /// - `SurfaceError::Fullscreen` - The host document denied the request
    fn request_fullscreen(&self) -> Result<(), SurfaceError>;

    /// Exits fullscreen via the host document.
    fn exit_fullscreen(&self);

    /// Returns true while this container is the fullscreen element.
    fn is_fullscreen(&self) -> bool;
}

/// Resolves element ids to surface handles.
///
/// Implemented by the host document binding; the simulation resolver backs
/// tests.
pub trait SurfaceResolver: Send + Sync {
    /// Looks up a container element by id.
    fn container_by_id(&self, id: &str) -> Option<Arc<dyn SurfaceHost>>;

    /// Looks up a video element by id.
    fn video_by_id(&self, id: &str) -> Option<Arc<dyn VideoSurface>>;
}

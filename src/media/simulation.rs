//! Simulated surfaces and media buffers for tests and development.
//!
//! These implementations mirror the observable behavior of the browser-side
//! collaborators closely enough to drive every player and session code path
//! without a DOM: scripted append failures, frame-rendered notifications,
//! and out-of-band detachment.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

use super::{
    BufferError, BufferResult, MediaBuffer, SurfaceError, SurfaceHost, SurfaceResolver,
    VideoSurface,
};

const SIMULATED_SEGMENT_SECS: f64 = 0.5;

/// In-memory media buffer with scriptable failures.
///
/// Renders a frame for every media append after the init segment, so play
/// flows driven against it reach their first frame without a real decoder.
pub struct SimulatedMediaBuffer {
    appended: Mutex<Vec<Bytes>>,
    evicted_up_to: Mutex<f64>,
    evictions: AtomicU32,
    quota_failures: AtomicU32,
    generic_failures: AtomicU32,
    closed: AtomicBool,
    auto_render: bool,
    frames_tx: watch::Sender<u64>,
}

impl SimulatedMediaBuffer {
    /// Creates a buffer that accepts every append and auto-renders frames.
    pub fn new() -> Self {
        let (frames_tx, _) = watch::channel(0);
        Self {
            appended: Mutex::new(Vec::new()),
            evicted_up_to: Mutex::new(0.0),
            evictions: AtomicU32::new(0),
            quota_failures: AtomicU32::new(0),
            generic_failures: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            auto_render: true,
            frames_tx,
        }
    }

    /// Creates a buffer that renders frames only via
    /// [`SimulatedMediaBuffer::render_frame`].
    pub fn without_auto_render() -> Self {
        Self {
            auto_render: false,
            ..Self::new()
        }
    }

    /// Reports one rendered frame.
    pub fn render_frame(&self) {
        self.frames_tx.send_modify(|rendered| *rendered += 1);
    }

    /// Scripts the next `count` appends to fail with quota exhaustion.
    pub fn fail_next_appends_with_quota(&self, count: u32) {
        self.quota_failures.store(count, Ordering::SeqCst);
    }

    /// Scripts the next `count` appends to fail with a generic error.
    pub fn fail_next_appends(&self, count: u32) {
        self.generic_failures.store(count, Ordering::SeqCst);
    }

    /// Returns how many appends have succeeded.
    pub fn appended_count(&self) -> usize {
        self.appended.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Returns how many eviction passes have run.
    pub fn eviction_count(&self) -> u32 {
        self.evictions.load(Ordering::SeqCst)
    }

    /// Returns true once the buffer has been released.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedMediaBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaBuffer for SimulatedMediaBuffer {
    async fn append(&self, segment: Bytes) -> BufferResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BufferError::Detached);
        }
        if decrement_if_positive(&self.quota_failures) {
            return Err(BufferError::QuotaExceeded);
        }
        if decrement_if_positive(&self.generic_failures) {
            return Err(BufferError::Append {
                reason: "simulated append failure".to_string(),
            });
        }

        let count = {
            let mut appended = self.appended.lock().unwrap_or_else(|p| p.into_inner());
            appended.push(segment);
            appended.len()
        };

        // The first append is the init segment; frames render only once
        // media follows it.
        if self.auto_render && count >= 2 {
            self.render_frame();
        }
        Ok(())
    }

    fn frames(&self) -> watch::Receiver<u64> {
        self.frames_tx.subscribe()
    }

    fn buffered_ranges(&self) -> Vec<(f64, f64)> {
        let appended = self.appended.lock().unwrap_or_else(|p| p.into_inner()).len();
        let evicted = *self.evicted_up_to.lock().unwrap_or_else(|p| p.into_inner());
        let end = appended as f64 * SIMULATED_SEGMENT_SECS;
        if end > evicted {
            vec![(evicted, end)]
        } else {
            Vec::new()
        }
    }

    async fn evict(&self, _start: f64, end: f64) -> BufferResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BufferError::Detached);
        }
        self.evictions.fetch_add(1, Ordering::SeqCst);
        let mut evicted = self.evicted_up_to.lock().unwrap_or_else(|p| p.into_inner());
        if end > *evicted {
            *evicted = end;
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn decrement_if_positive(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            if current > 0 { Some(current - 1) } else { None }
        })
        .is_ok()
}

/// Simulated video surface with observable class, mute, and source state.
pub struct SimulatedSurface {
    classes: Mutex<HashSet<String>>,
    muted: AtomicBool,
    playsinline: AtomicBool,
    source_clears: AtomicU32,
    fail_attach: AtomicBool,
    attachment_tx: watch::Sender<bool>,
    buffers: Mutex<Vec<Arc<SimulatedMediaBuffer>>>,
}

impl SimulatedSurface {
    /// Creates an attached surface with no media source.
    pub fn new() -> Self {
        let (attachment_tx, _) = watch::channel(true);
        Self {
            classes: Mutex::new(HashSet::new()),
            muted: AtomicBool::new(false),
            playsinline: AtomicBool::new(false),
            source_clears: AtomicU32::new(0),
            fail_attach: AtomicBool::new(false),
            attachment_tx,
            buffers: Mutex::new(Vec::new()),
        }
    }

    /// Scripts the next media-source attachment to fail.
    pub fn fail_next_attach(&self) {
        self.fail_attach.store(true, Ordering::SeqCst);
    }

    /// Reports one rendered frame on the most recently attached media
    /// source.
    pub fn render_frame(&self) {
        if let Some(buffer) = self.attached_buffer() {
            buffer.render_frame();
        }
    }

    /// Simulates out-of-band removal of the surface's host element.
    pub fn detach_from_document(&self) {
        let _ = self.attachment_tx.send(false);
    }

    /// Returns true if the given CSS class is currently applied.
    pub fn has_class(&self, class: &str) -> bool {
        self.classes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(class)
    }

    /// Returns true if the surface is muted.
    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /// Returns true if inline playback is set.
    pub fn is_playsinline(&self) -> bool {
        self.playsinline.load(Ordering::SeqCst)
    }

    /// Returns how many times the source was cleared to the empty sentinel.
    pub fn source_clear_count(&self) -> u32 {
        self.source_clears.load(Ordering::SeqCst)
    }

    /// Returns the most recently attached media buffer.
    pub fn attached_buffer(&self) -> Option<Arc<SimulatedMediaBuffer>> {
        self.buffers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .last()
            .cloned()
    }
}

impl Default for SimulatedSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoSurface for SimulatedSurface {
    fn add_class(&self, class: &str) {
        self.classes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(class.to_string());
    }

    fn remove_class(&self, class: &str) {
        self.classes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(class);
    }

    fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    fn set_playsinline(&self, playsinline: bool) {
        self.playsinline.store(playsinline, Ordering::SeqCst);
    }

    fn clear_source(&self) {
        self.source_clears.fetch_add(1, Ordering::SeqCst);
        let buffers: Vec<Arc<SimulatedMediaBuffer>> = self
            .buffers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for buffer in buffers {
            buffer.closed.store(true, Ordering::SeqCst);
        }
    }

    fn attach_media_source(&self, _mime_codec: &str) -> Result<Arc<dyn MediaBuffer>, SurfaceError> {
        if self.fail_attach.swap(false, Ordering::SeqCst) {
            return Err(SurfaceError::CreationFailed {
                reason: "simulated attach failure".to_string(),
            });
        }
        if !*self.attachment_tx.borrow() {
            return Err(SurfaceError::Detached);
        }
        let buffer = Arc::new(SimulatedMediaBuffer::new());
        self.buffers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Arc::clone(&buffer));
        Ok(buffer)
    }

    fn attachment(&self) -> watch::Receiver<bool> {
        self.attachment_tx.subscribe()
    }

    fn dimensions(&self) -> Option<(u32, u32)> {
        Some((1920, 1080))
    }
}

/// Simulated container element.
pub struct SimulatedSurfaceHost {
    classes: Mutex<HashSet<String>>,
    children: Mutex<Vec<Arc<SimulatedSurface>>>,
    fullscreen: AtomicBool,
}

impl SimulatedSurfaceHost {
    /// Creates an empty container.
    pub fn new() -> Self {
        Self {
            classes: Mutex::new(HashSet::new()),
            children: Mutex::new(Vec::new()),
            fullscreen: AtomicBool::new(false),
        }
    }

    /// Returns true if the given CSS class is currently applied.
    pub fn has_class(&self, class: &str) -> bool {
        self.classes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(class)
    }

    /// Returns the surfaces currently attached as children.
    pub fn children(&self) -> Vec<Arc<SimulatedSurface>> {
        self.children
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl Default for SimulatedSurfaceHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SurfaceHost for SimulatedSurfaceHost {
    fn add_class(&self, class: &str) {
        self.classes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(class.to_string());
    }

    fn remove_class(&self, class: &str) {
        self.classes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(class);
    }

    fn create_video_surface(&self) -> Result<Arc<dyn VideoSurface>, SurfaceError> {
        let surface = Arc::new(SimulatedSurface::new());
        self.children
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Arc::clone(&surface));
        Ok(surface)
    }

    fn remove_video_surface(&self, surface: &Arc<dyn VideoSurface>) {
        self.children
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|child| {
                let child: Arc<dyn VideoSurface> = Arc::clone(child) as Arc<dyn VideoSurface>;
                !Arc::ptr_eq(&child, surface)
            });
    }

    fn request_fullscreen(&self) -> Result<(), SurfaceError> {
        self.fullscreen.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn exit_fullscreen(&self) {
        self.fullscreen.store(false, Ordering::SeqCst);
    }

    fn is_fullscreen(&self) -> bool {
        self.fullscreen.load(Ordering::SeqCst)
    }
}

/// Simulated id-to-handle resolver.
#[derive(Default)]
pub struct SimulatedResolver {
    containers: Mutex<HashMap<String, Arc<dyn SurfaceHost>>>,
    videos: Mutex<HashMap<String, Arc<dyn VideoSurface>>>,
}

impl SimulatedResolver {
    /// Creates an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a container under `id`.
    pub fn register_container(&self, id: &str, container: Arc<dyn SurfaceHost>) {
        self.containers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id.to_string(), container);
    }

    /// Registers a video surface under `id`.
    pub fn register_video(&self, id: &str, surface: Arc<dyn VideoSurface>) {
        self.videos
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id.to_string(), surface);
    }
}

impl SurfaceResolver for SimulatedResolver {
    fn container_by_id(&self, id: &str) -> Option<Arc<dyn SurfaceHost>> {
        self.containers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
    }

    fn video_by_id(&self, id: &str) -> Option<Arc<dyn VideoSurface>> {
        self.videos
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_quota_failures() {
        let buffer = SimulatedMediaBuffer::new();
        buffer.fail_next_appends_with_quota(1);
        let result = buffer.append(Bytes::from_static(b"data")).await;
        assert!(matches!(result, Err(BufferError::QuotaExceeded)));
        buffer.append(Bytes::from_static(b"data")).await.unwrap();
        assert_eq!(buffer.appended_count(), 1);
    }

    #[tokio::test]
    async fn test_frames_render_after_media_append() {
        let surface = SimulatedSurface::new();
        let buffer = surface.attach_media_source("video/mp4").unwrap();
        let frames = buffer.frames();

        buffer.append(Bytes::from_static(b"init")).await.unwrap();
        assert_eq!(*frames.borrow(), 0);
        buffer.append(Bytes::from_static(b"media")).await.unwrap();
        assert_eq!(*frames.borrow(), 1);
    }

    #[tokio::test]
    async fn test_frames_attributed_to_their_own_buffer() {
        let surface = SimulatedSurface::new();
        let first = surface.attach_media_source("video/mp4").unwrap();
        let second = surface.attach_media_source("video/mp4").unwrap();
        let first_frames = first.frames();

        second.append(Bytes::from_static(b"init")).await.unwrap();
        second.append(Bytes::from_static(b"media")).await.unwrap();
        assert_eq!(*first_frames.borrow(), 0);
        assert_eq!(*second.frames().borrow(), 1);
    }

    #[test]
    fn test_host_child_removal() {
        let host = SimulatedSurfaceHost::new();
        let surface = host.create_video_surface().unwrap();
        assert_eq!(host.children().len(), 1);
        host.remove_video_surface(&surface);
        assert!(host.children().is_empty());
    }

    #[test]
    fn test_detached_surface_rejects_attach() {
        let surface = SimulatedSurface::new();
        surface.detach_from_document();
        assert!(matches!(
            surface.attach_media_source("video/mp4"),
            Err(SurfaceError::Detached)
        ));
    }
}

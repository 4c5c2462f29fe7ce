//! Backend test double
//!
//! [`SyntheticBackend`] never touches real pixels. Handles carry dimensions
//! only and pixel buffers allocate nothing, so engine tests can work with
//! 10000 px pages cheaply while asserting on every handle and buffer the
//! engine creates and releases.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use crate::backend::{BackendResult, DecodeError, ImageBackend, RawHandle, RawImage};
use crate::geometry::{resize_dimensions, PixelRect, Resolution, SourceDimensions};
use crate::pixels::{PixelBuffer, SharedPixels};
use crate::source::ImageSource;
use crate::upscale::{UpscaleError, Upscaler};

/// Backend operations that can be gated or made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    Probe,
    Decode,
    ExtractRegion,
    Resize,
    ImportPixels,
    ToPixelBuffer,
}

/// Counters observed by tests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyntheticStats {
    pub handles_created: u64,
    pub handles_released: u64,
    pub double_releases: u64,
    pub buffers_created: u64,
    pub buffers_released: u64,
    pub decode_calls: u64,
    pub extract_calls: u64,
    pub resize_calls: u64,
    pub import_calls: u64,
    pub max_concurrent_calls: u64,
    /// RGBA8 bytes behind live handles
    pub live_bytes: u64,
    pub peak_live_bytes: u64,
}

impl SyntheticStats {
    pub fn live_handles(&self) -> u64 {
        self.handles_created - self.handles_released
    }

    pub fn live_buffers(&self) -> u64 {
        self.buffers_created - self.buffers_released
    }
}

#[derive(Default)]
struct Inner {
    live: HashMap<RawHandle, (u32, u32)>,
    released: HashSet<RawHandle>,
    stats: SyntheticStats,
    failures: HashMap<BackendOp, DecodeError>,
    gated: HashSet<BackendOp>,
    gated_sources: HashSet<SourceDimensions>,
    in_flight: u64,
    blocked: u64,
}

struct Shared {
    inner: Mutex<Inner>,
    gate: Condvar,
    next_handle: AtomicU64,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Counting backend double
///
/// Sources are read as `"<width>x<height>"` strings when given as memory;
/// other sources fall back to the default dimensions.
#[derive(Clone)]
pub struct SyntheticBackend {
    shared: Arc<Shared>,
    default_dimensions: SourceDimensions,
}

impl SyntheticBackend {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                gate: Condvar::new(),
                next_handle: AtomicU64::new(1),
            }),
            default_dimensions: SourceDimensions::new(width, height),
        }
    }

    /// An in-memory source that this backend decodes as `width` x `height`
    pub fn source(width: u32, height: u32) -> ImageSource {
        ImageSource::from_bytes(format!("{}x{}", width, height).into_bytes())
    }

    pub fn stats(&self) -> SyntheticStats {
        self.shared.lock().stats.clone()
    }

    /// Make every future call of `op` fail with `error`
    pub fn fail(&self, op: BackendOp, error: DecodeError) {
        self.shared.lock().failures.insert(op, error);
    }

    pub fn clear_failure(&self, op: BackendOp) {
        self.shared.lock().failures.remove(&op);
    }

    /// Block calls of `op` until [`open_gate`](Self::open_gate)
    pub fn close_gate(&self, op: BackendOp) {
        self.shared.lock().gated.insert(op);
    }

    pub fn open_gate(&self, op: BackendOp) {
        self.shared.lock().gated.remove(&op);
        self.shared.gate.notify_all();
    }

    /// Block decodes of sources of `width` x `height` only
    pub fn close_decode_gate(&self, width: u32, height: u32) {
        self.shared
            .lock()
            .gated_sources
            .insert(SourceDimensions::new(width, height));
    }

    pub fn open_decode_gate(&self, width: u32, height: u32) {
        self.shared
            .lock()
            .gated_sources
            .remove(&SourceDimensions::new(width, height));
        self.shared.gate.notify_all();
    }

    /// Wait until at least `count` calls are parked at a closed gate
    pub fn wait_for_blocked(&self, count: u64, timeout: Duration) -> bool {
        let guard = self.shared.lock();
        let (guard, _) = self
            .shared
            .gate
            .wait_timeout_while(guard, timeout, |inner| inner.blocked < count)
            .unwrap_or_else(PoisonError::into_inner);
        guard.blocked >= count
    }

    fn dimensions_of(&self, source: &ImageSource) -> Result<SourceDimensions, DecodeError> {
        match source {
            ImageSource::Memory(bytes) => {
                let text = std::str::from_utf8(bytes)
                    .map_err(|_| DecodeError::UnsupportedFormat("not a synthetic source".into()))?;
                let (w, h) = text
                    .split_once('x')
                    .ok_or_else(|| DecodeError::UnsupportedFormat(text.to_string()))?;
                let width = w
                    .parse()
                    .map_err(|_| DecodeError::CorruptData(text.to_string()))?;
                let height = h
                    .parse()
                    .map_err(|_| DecodeError::CorruptData(text.to_string()))?;
                Ok(SourceDimensions::new(width, height))
            }
            ImageSource::File(_) => Ok(self.default_dimensions),
        }
    }

    /// Common entry for every native call: gate, failure injection and
    /// concurrency tracking
    fn enter(&self, op: BackendOp) -> Result<CallGuard<'_>, DecodeError> {
        let mut inner = self.shared.lock();
        inner.in_flight += 1;
        inner.stats.max_concurrent_calls = inner.stats.max_concurrent_calls.max(inner.in_flight);

        if inner.gated.contains(&op) {
            inner.blocked += 1;
            self.shared.gate.notify_all();
            while inner.gated.contains(&op) {
                inner = self
                    .shared
                    .gate
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            inner.blocked -= 1;
        }

        if let Some(error) = inner.failures.get(&op).map(clone_error) {
            inner.in_flight -= 1;
            return Err(error);
        }
        drop(inner);
        Ok(CallGuard { backend: self })
    }

    fn hold_source(&self, dims: SourceDimensions) {
        let mut inner = self.shared.lock();
        if inner.gated_sources.contains(&dims) {
            inner.blocked += 1;
            self.shared.gate.notify_all();
            while inner.gated_sources.contains(&dims) {
                inner = self
                    .shared
                    .gate
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            inner.blocked -= 1;
        }
    }

    fn create(&self, width: u32, height: u32) -> RawImage {
        let handle = RawHandle(self.shared.next_handle.fetch_add(1, Ordering::Relaxed));
        let mut inner = self.shared.lock();
        inner.live.insert(handle, (width, height));
        inner.stats.handles_created += 1;
        inner.stats.live_bytes += rgba_bytes(width, height);
        inner.stats.peak_live_bytes = inner.stats.peak_live_bytes.max(inner.stats.live_bytes);
        RawImage::new(handle, width, height)
    }

    fn lookup(&self, handle: RawHandle) -> BackendResult<(u32, u32)> {
        self.shared
            .lock()
            .live
            .get(&handle)
            .copied()
            .ok_or_else(|| DecodeError::CorruptData(format!("handle {} is not live", handle.0)))
    }
}

fn rgba_bytes(width: u32, height: u32) -> u64 {
    width as u64 * height as u64 * 4
}

struct CallGuard<'a> {
    backend: &'a SyntheticBackend,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.backend.shared.lock().in_flight -= 1;
    }
}

fn clone_error(error: &DecodeError) -> DecodeError {
    match error {
        DecodeError::UnsupportedFormat(m) => DecodeError::UnsupportedFormat(m.clone()),
        DecodeError::CorruptData(m) => DecodeError::CorruptData(m.clone()),
        DecodeError::OutOfBounds {
            rect,
            width,
            height,
        } => DecodeError::OutOfBounds {
            rect: *rect,
            width: *width,
            height: *height,
        },
        DecodeError::NativeAllocationFailure(m) => DecodeError::NativeAllocationFailure(m.clone()),
        DecodeError::Cancelled => DecodeError::Cancelled,
        DecodeError::Io(e) => DecodeError::Io(std::io::Error::new(e.kind(), e.to_string())),
    }
}

impl ImageBackend for SyntheticBackend {
    fn probe_dimensions(&self, source: &ImageSource) -> BackendResult<SourceDimensions> {
        let _call = self.enter(BackendOp::Probe)?;
        self.dimensions_of(source)
    }

    fn decode(&self, source: &ImageSource) -> BackendResult<RawImage> {
        let _call = self.enter(BackendOp::Decode)?;
        let dims = self.dimensions_of(source)?;
        self.hold_source(dims);
        self.shared.lock().stats.decode_calls += 1;
        Ok(self.create(dims.width, dims.height))
    }

    fn extract_region(&self, handle: RawHandle, rect: PixelRect) -> BackendResult<RawImage> {
        let _call = self.enter(BackendOp::ExtractRegion)?;
        self.shared.lock().stats.extract_calls += 1;
        let (width, height) = self.lookup(handle)?;
        if !rect.fits_within(width, height) {
            return Err(DecodeError::OutOfBounds {
                rect,
                width,
                height,
            });
        }
        Ok(self.create(rect.width, rect.height))
    }

    fn resize(
        &self,
        handle: RawHandle,
        width: u32,
        height: u32,
        crop_to_fill: bool,
    ) -> BackendResult<RawImage> {
        let _call = self.enter(BackendOp::Resize)?;
        self.shared.lock().stats.resize_calls += 1;
        let (w, h) = self.lookup(handle)?;
        let out = resize_dimensions(
            Resolution::new(w, h),
            Resolution::new(width, height),
            crop_to_fill,
        );
        Ok(self.create(out.width, out.height))
    }

    fn import_pixels(&self, pixels: &dyn PixelBuffer) -> BackendResult<RawImage> {
        let _call = self.enter(BackendOp::ImportPixels)?;
        self.shared.lock().stats.import_calls += 1;
        Ok(self.create(pixels.width(), pixels.height()))
    }

    fn to_pixel_buffer(&self, handle: RawHandle) -> BackendResult<SharedPixels> {
        let _call = self.enter(BackendOp::ToPixelBuffer)?;
        let (width, height) = self.lookup(handle)?;
        self.shared.lock().stats.buffers_created += 1;
        Ok(Arc::new(CountingPixels {
            width,
            height,
            shared: Arc::clone(&self.shared),
        }))
    }

    fn release(&self, handle: RawHandle) {
        let mut inner = self.shared.lock();
        if let Some((width, height)) = inner.live.remove(&handle) {
            inner.released.insert(handle);
            inner.stats.handles_released += 1;
            inner.stats.live_bytes -= rgba_bytes(width, height);
        } else if inner.released.contains(&handle) {
            inner.stats.double_releases += 1;
        }
    }
}

/// Dimension-only pixel buffer that reports its drop
pub struct CountingPixels {
    width: u32,
    height: u32,
    shared: Arc<Shared>,
}

impl PixelBuffer for CountingPixels {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }
}

impl Drop for CountingPixels {
    fn drop(&mut self) {
        self.shared.lock().stats.buffers_released += 1;
    }
}

/// Upscaler double multiplying dimensions by a fixed factor
pub struct ScalingUpscaler {
    factor: u32,
    fail: bool,
    calls: AtomicU64,
}

impl ScalingUpscaler {
    pub fn new(factor: u32) -> Self {
        Self {
            factor: factor.max(1),
            fail: false,
            calls: AtomicU64::new(0),
        }
    }

    /// An upscaler whose every call fails
    pub fn failing() -> Self {
        Self {
            factor: 1,
            fail: true,
            calls: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

struct PlainPixels {
    width: u32,
    height: u32,
}

impl PixelBuffer for PlainPixels {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }
}

impl Upscaler for ScalingUpscaler {
    fn upscale(&self, input: &dyn PixelBuffer) -> Result<SharedPixels, UpscaleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(UpscaleError::Failed("injected failure".to_string()));
        }
        Ok(Arc::new(PlainPixels {
            width: input.width() * self.factor,
            height: input.height() * self.factor,
        }))
    }

    fn name(&self) -> &str {
        "scaling"
    }
}

//! Lifecycle of one display mirroring session.

use crate::authorization::CaptureCredential;
use crate::encode::RawFrame;
use crate::error::CaptureError;
use crate::mirror::{DisplayMetrics, FrameBuffer, MirrorHandle, MirrorPlatform, OutputSurface};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Process-wide "a session is open" flag. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct SessionGate {
    busy: Arc<AtomicBool>,
}

impl SessionGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn try_acquire(&self) -> Option<GateLease> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| GateLease {
                busy: self.busy.clone(),
            })
    }
}

#[derive(Debug)]
pub struct GateLease {
    busy: Arc<AtomicBool>,
}

impl Drop for GateLease {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

/// Opens mirroring sessions on a platform, at most one at a time per gate.
pub struct ScreenMirror {
    platform: Arc<dyn MirrorPlatform>,
    gate: SessionGate,
    next_id: AtomicU64,
}

impl ScreenMirror {
    pub fn new(platform: Arc<dyn MirrorPlatform>, gate: SessionGate) -> Self {
        Self {
            platform,
            gate,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn gate(&self) -> &SessionGate {
        &self.gate
    }

    pub fn display_metrics(&self) -> Result<DisplayMetrics, CaptureError> {
        self.platform
            .display_metrics()
            .map_err(|err| CaptureError::unavailable(format!("display metrics: {err:#}")))
    }

    /// Redeems `credential` into a live session whose output surface streams
    /// the display into a frame buffer of `metrics` size. If any step fails,
    /// whatever was acquired so far is released before returning.
    pub fn open(
        &self,
        credential: &CaptureCredential,
        metrics: DisplayMetrics,
    ) -> Result<CaptureSession, CaptureError> {
        let lease = self
            .gate
            .try_acquire()
            .ok_or_else(|| CaptureError::unavailable("another capture session is open"))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut session = CaptureSession {
            id,
            metrics,
            mirror: None,
            surface: None,
            buffer: None,
            lease: Some(lease),
        };

        session.buffer = Some(
            self.platform
                .open_frame_buffer(metrics)
                .map_err(|err| CaptureError::unavailable(format!("frame buffer: {err:#}")))?,
        );

        credential.redeem()?;
        let mirror = session.mirror.insert(
            self.platform
                .redeem(credential)
                .map_err(|err| CaptureError::unavailable(format!("mirroring: {err:#}")))?,
        );

        let surface = mirror
            .create_output_surface(metrics)
            .map_err(|err| CaptureError::unavailable(format!("output surface: {err:#}")))?;
        session.surface = Some(surface);

        log::info!(
            "capture session {id} open at {}x{} ({} dpi)",
            metrics.width,
            metrics.height,
            metrics.density_dpi
        );
        Ok(session)
    }
}

pub struct CaptureSession {
    id: u64,
    metrics: DisplayMetrics,
    mirror: Option<Box<dyn MirrorHandle>>,
    surface: Option<Box<dyn OutputSurface>>,
    buffer: Option<Box<dyn FrameBuffer>>,
    lease: Option<GateLease>,
}

impl CaptureSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn metrics(&self) -> DisplayMetrics {
        self.metrics
    }

    pub fn is_open(&self) -> bool {
        self.lease.is_some()
    }

    fn declared_size(&self) -> (u32, u32) {
        (self.metrics.width, self.metrics.height)
    }

    /// Takes the most recent frame. Callers are expected to have waited for the
    /// settling interval first; an empty buffer is reported, not retried. A
    /// frame that does not match the declared resolution is refused.
    pub async fn harvest_frame(&mut self) -> Result<RawFrame, CaptureError> {
        if !self.is_open() {
            return Err(CaptureError::unavailable("capture session is closed"));
        }
        let buffer = self
            .buffer
            .as_mut()
            .ok_or_else(|| CaptureError::unavailable("capture session has no frame buffer"))?;

        match buffer.acquire_latest().await {
            Ok(Some(frame)) if (frame.width, frame.height) != self.declared_size() => {
                Err(CaptureError::unavailable(format!(
                    "frame is {}x{} but the display was declared {}x{}",
                    frame.width, frame.height, self.metrics.width, self.metrics.height
                )))
            }
            Ok(Some(frame)) => {
                log::debug!("session {} harvested {frame:?}", self.id);
                Ok(frame)
            }
            Ok(None) => Err(CaptureError::NoFrameAvailable),
            Err(err) => Err(CaptureError::unavailable(format!("frame read: {err:#}"))),
        }
    }

    /// Releases surface, buffer and mirror in that order. Safe to call again.
    pub fn close(&mut self) {
        if let Some(mut surface) = self.surface.take() {
            surface.release();
        }
        if let Some(mut buffer) = self.buffer.take() {
            buffer.close();
        }
        if let Some(mut mirror) = self.mirror.take() {
            mirror.stop();
        }
        if self.lease.take().is_some() {
            log::debug!("capture session {} closed", self.id);
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("id", &self.id)
            .field("metrics", &self.metrics)
            .field("open", &self.is_open())
            .finish()
    }
}

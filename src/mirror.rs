//! OS display-mirroring collaborators.
//!
//! A mirroring session is built from three platform resources: a frame buffer
//! that receives frames, a mirror handle redeemed from a capture credential, and
//! a virtual output surface that streams the display into the buffer. The
//! traits here are the seam; [`crate::session`] owns their lifecycle.

use crate::authorization::CaptureCredential;
use crate::encode::{RGBA_BYTES_PER_PIXEL, RawFrame};
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use image::RgbaImage;
use image::imageops::{self, FilterType};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayMetrics {
    pub width: u32,
    pub height: u32,
    pub density_dpi: u32,
}

#[async_trait]
pub trait FrameBuffer: Send {
    /// Latest frame delivered by the output surface, if any arrived yet.
    async fn acquire_latest(&mut self) -> Result<Option<RawFrame>>;
    fn close(&mut self);
}

pub trait OutputSurface: Send {
    fn release(&mut self);
}

pub trait MirrorHandle: Send {
    fn create_output_surface(&mut self, metrics: DisplayMetrics)
    -> Result<Box<dyn OutputSurface>>;
    fn stop(&mut self);
}

pub trait MirrorPlatform: Send + Sync {
    fn display_metrics(&self) -> Result<DisplayMetrics>;
    fn open_frame_buffer(&self, metrics: DisplayMetrics) -> Result<Box<dyn FrameBuffer>>;
    fn redeem(&self, credential: &CaptureCredential) -> Result<Box<dyn MirrorHandle>>;
}

const SCREENSHOT_TIMEOUT: Duration = Duration::from_secs(10);
/// Density of one display point at a backing scale factor of 1.
const POINT_DENSITY_DPI: u32 = 72;

/// Mirrors the main display through the macOS `screencapture` tool. Each
/// acquired frame is read into memory and the temporary file removed at once.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScreencaptureMirror;

impl MirrorPlatform for ScreencaptureMirror {
    fn display_metrics(&self) -> Result<DisplayMetrics> {
        main_display_metrics()
    }

    fn open_frame_buffer(&self, metrics: DisplayMetrics) -> Result<Box<dyn FrameBuffer>> {
        Ok(Box::new(ScreencaptureFrameBuffer {
            metrics,
            closed: false,
        }))
    }

    fn redeem(&self, credential: &CaptureCredential) -> Result<Box<dyn MirrorHandle>> {
        if credential.grant_payload().is_empty() {
            bail!("capture grant carries no payload");
        }
        if !crate::permissions::screen_recording_status().is_granted() {
            bail!("screen recording permission is not granted");
        }
        Ok(Box::new(ScreencaptureHandle { stopped: false }))
    }
}

struct ScreencaptureHandle {
    stopped: bool,
}

impl MirrorHandle for ScreencaptureHandle {
    fn create_output_surface(
        &mut self,
        _metrics: DisplayMetrics,
    ) -> Result<Box<dyn OutputSurface>> {
        if self.stopped {
            bail!("mirroring already stopped");
        }
        Ok(Box::new(ScreencaptureSurface))
    }

    fn stop(&mut self) {
        self.stopped = true;
    }
}

struct ScreencaptureSurface;

impl OutputSurface for ScreencaptureSurface {
    fn release(&mut self) {}
}

struct ScreencaptureFrameBuffer {
    metrics: DisplayMetrics,
    closed: bool,
}

static FRAME_SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn temp_frame_path() -> PathBuf {
    let sequence = FRAME_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "snaplens-frame-{}-{sequence}.png",
        std::process::id()
    ))
}

#[async_trait]
impl FrameBuffer for ScreencaptureFrameBuffer {
    async fn acquire_latest(&mut self) -> Result<Option<RawFrame>> {
        if self.closed {
            bail!("frame buffer is closed");
        }

        let path = temp_frame_path();
        let mut command = Command::new("screencapture");
        command.arg("-x").arg("-t").arg("png").arg(&path);

        let status = timeout(SCREENSHOT_TIMEOUT, command.status())
            .await
            .map_err(|_| {
                anyhow!(
                    "screencapture timed out after {:.0}s, check Screen Recording permission",
                    SCREENSHOT_TIMEOUT.as_secs_f32()
                )
            })?
            .context("failed to execute screencapture")?;

        if !status.success() {
            let _ = std::fs::remove_file(&path);
            bail!("screencapture exited with status {status}");
        }

        let Some(image) = take_frame_file(path).await? else {
            return Ok(None);
        };

        let metrics = self.metrics;
        let image = tokio::task::spawn_blocking(move || fit_to_display(image, metrics))
            .await
            .context("frame scaler panicked")?;
        let (width, height) = image.dimensions();
        Ok(Some(RawFrame::packed(width, height, image.into_raw())))
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Decodes a captured file and removes it, whether or not decoding worked.
async fn take_frame_file(path: PathBuf) -> Result<Option<RgbaImage>> {
    let decode_path = path.clone();
    let joined = tokio::task::spawn_blocking(move || image::open(&decode_path)).await;
    let _ = std::fs::remove_file(&path);
    match joined.context("frame decoder panicked")? {
        Ok(image) => Ok(Some(image.to_rgba8())),
        Err(err) => {
            log::warn!("discarding unreadable frame: {err}");
            Ok(None)
        }
    }
}

/// Scales `image` to the declared display size when the captured file came out
/// at a different resolution.
fn fit_to_display(image: RgbaImage, metrics: DisplayMetrics) -> RgbaImage {
    if image.dimensions() == (metrics.width, metrics.height) {
        return image;
    }
    log::debug!(
        "scaling {}x{} frame to the declared {}x{}",
        image.width(),
        image.height(),
        metrics.width,
        metrics.height
    );
    imageops::resize(&image, metrics.width, metrics.height, FilterType::Triangle)
}

/// Native pixel metrics of a display measured in points. Density follows the
/// backing scale factor.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn native_metrics(
    points: (usize, usize),
    pixels: Option<(usize, usize)>,
) -> Result<DisplayMetrics> {
    let (points_wide, points_high) = points;
    let (pixels_wide, pixels_high) = pixels
        .filter(|(wide, high)| *wide > 0 && *high > 0)
        .unwrap_or(points);
    if pixels_wide == 0 || pixels_high == 0 || points_wide == 0 {
        bail!("main display reported no pixels");
    }
    let density = POINT_DENSITY_DPI as usize * pixels_wide / points_wide;
    Ok(DisplayMetrics {
        width: u32::try_from(pixels_wide).context("display width out of range")?,
        height: u32::try_from(pixels_high).context("display height out of range")?,
        density_dpi: u32::try_from(density).context("display density out of range")?,
    })
}

#[cfg(target_os = "macos")]
fn main_display_metrics() -> Result<DisplayMetrics> {
    let (points, pixels) = unsafe {
        let display = CGMainDisplayID();
        let points = (CGDisplayPixelsWide(display), CGDisplayPixelsHigh(display));
        let mode = CGDisplayCopyDisplayMode(display);
        let pixels = if mode.is_null() {
            None
        } else {
            let pixels = (
                CGDisplayModeGetPixelWidth(mode),
                CGDisplayModeGetPixelHeight(mode),
            );
            CGDisplayModeRelease(mode);
            Some(pixels)
        };
        (points, pixels)
    };
    native_metrics(points, pixels)
}

#[cfg(not(target_os = "macos"))]
fn main_display_metrics() -> Result<DisplayMetrics> {
    bail!("display mirroring through screencapture is only available on macOS")
}

#[cfg(target_os = "macos")]
#[link(name = "CoreGraphics", kind = "framework")]
unsafe extern "C" {
    fn CGMainDisplayID() -> u32;
    fn CGDisplayPixelsWide(display: u32) -> usize;
    fn CGDisplayPixelsHigh(display: u32) -> usize;
    fn CGDisplayCopyDisplayMode(display: u32) -> *mut std::ffi::c_void;
    fn CGDisplayModeGetPixelWidth(mode: *mut std::ffi::c_void) -> usize;
    fn CGDisplayModeGetPixelHeight(mode: *mut std::ffi::c_void) -> usize;
    fn CGDisplayModeRelease(mode: *mut std::ffi::c_void);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResourceCounts {
    pub handles: usize,
    pub surfaces: usize,
    pub buffers: usize,
}

impl ResourceCounts {
    pub fn total(&self) -> usize {
        self.handles + self.surfaces + self.buffers
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Bookkeeping of every resource the synthetic platform handed out.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResourceLedger {
    pub live: ResourceCounts,
    pub opened: ResourceCounts,
    pub released: ResourceCounts,
    pub double_releases: usize,
}

#[derive(Debug, Default)]
struct SyntheticShared {
    ledger: ResourceLedger,
    surface_live_since: Option<Instant>,
}

#[derive(Debug, Clone, Copy, Default)]
struct SyntheticOptions {
    row_padding_px: u32,
    settle: Duration,
    starved: bool,
    reject_redeem: bool,
    fail_surface: bool,
    frame_size: Option<(u32, u32)>,
}

/// In-process stand-in for the display mirroring service. Frames follow
/// [`synthetic_pixel`]; padding bytes are filled with junk so that a missed
/// crop is visible.
#[derive(Debug, Clone)]
pub struct SyntheticMirror {
    metrics: DisplayMetrics,
    options: SyntheticOptions,
    shared: Arc<Mutex<SyntheticShared>>,
}

pub const PADDING_FILL: [u8; 4] = [0xAB, 0xCD, 0xEF, 0x01];

pub fn synthetic_pixel(x: u32, y: u32) -> [u8; 4] {
    [
        ((x * 13 + y * 3) % 251) as u8,
        ((x * 5 + y * 11) % 251) as u8,
        ((x * 7 + y * 17) % 251) as u8,
        255,
    ]
}

impl SyntheticMirror {
    pub fn new(metrics: DisplayMetrics) -> Self {
        Self {
            metrics,
            options: SyntheticOptions::default(),
            shared: Arc::new(Mutex::new(SyntheticShared::default())),
        }
    }

    pub fn with_row_padding(mut self, padding_px: u32) -> Self {
        self.options.row_padding_px = padding_px;
        self
    }

    /// Frames only become available this long after the surface starts.
    pub fn with_settle_time(mut self, settle: Duration) -> Self {
        self.options.settle = settle;
        self
    }

    /// Never delivers a frame.
    pub fn starved(mut self) -> Self {
        self.options.starved = true;
        self
    }

    pub fn rejecting_redeem(mut self) -> Self {
        self.options.reject_redeem = true;
        self
    }

    pub fn failing_surface(mut self) -> Self {
        self.options.fail_surface = true;
        self
    }

    /// Renders frames at this size whatever the buffer was allocated for.
    pub fn with_frame_size(mut self, width: u32, height: u32) -> Self {
        self.options.frame_size = Some((width, height));
        self
    }

    pub fn ledger(&self) -> ResourceLedger {
        self.shared
            .lock()
            .expect("synthetic mirror mutex poisoned")
            .ledger
            .clone()
    }
}

impl MirrorPlatform for SyntheticMirror {
    fn display_metrics(&self) -> Result<DisplayMetrics> {
        Ok(self.metrics)
    }

    fn open_frame_buffer(&self, metrics: DisplayMetrics) -> Result<Box<dyn FrameBuffer>> {
        let mut shared = self.shared.lock().expect("synthetic mirror mutex poisoned");
        shared.ledger.opened.buffers += 1;
        shared.ledger.live.buffers += 1;
        Ok(Box::new(SyntheticFrameBuffer {
            shared: self.shared.clone(),
            metrics,
            options: self.options,
            closed: false,
        }))
    }

    fn redeem(&self, credential: &CaptureCredential) -> Result<Box<dyn MirrorHandle>> {
        if self.options.reject_redeem {
            bail!("mirroring request rejected by the display service");
        }
        if credential.grant_payload().is_empty() {
            bail!("capture grant carries no payload");
        }
        let mut shared = self.shared.lock().expect("synthetic mirror mutex poisoned");
        shared.ledger.opened.handles += 1;
        shared.ledger.live.handles += 1;
        Ok(Box::new(SyntheticHandle {
            shared: self.shared.clone(),
            fail_surface: self.options.fail_surface,
            stopped: false,
        }))
    }
}

struct SyntheticHandle {
    shared: Arc<Mutex<SyntheticShared>>,
    fail_surface: bool,
    stopped: bool,
}

impl MirrorHandle for SyntheticHandle {
    fn create_output_surface(
        &mut self,
        _metrics: DisplayMetrics,
    ) -> Result<Box<dyn OutputSurface>> {
        if self.stopped {
            bail!("mirroring already stopped");
        }
        if self.fail_surface {
            bail!("virtual display allocation failed");
        }
        let mut shared = self.shared.lock().expect("synthetic mirror mutex poisoned");
        shared.ledger.opened.surfaces += 1;
        shared.ledger.live.surfaces += 1;
        shared.surface_live_since = Some(Instant::now());
        Ok(Box::new(SyntheticSurface {
            shared: self.shared.clone(),
            released: false,
        }))
    }

    fn stop(&mut self) {
        let mut shared = self.shared.lock().expect("synthetic mirror mutex poisoned");
        if self.stopped {
            shared.ledger.double_releases += 1;
            return;
        }
        self.stopped = true;
        shared.ledger.live.handles -= 1;
        shared.ledger.released.handles += 1;
    }
}

struct SyntheticSurface {
    shared: Arc<Mutex<SyntheticShared>>,
    released: bool,
}

impl OutputSurface for SyntheticSurface {
    fn release(&mut self) {
        let mut shared = self.shared.lock().expect("synthetic mirror mutex poisoned");
        if self.released {
            shared.ledger.double_releases += 1;
            return;
        }
        self.released = true;
        shared.ledger.live.surfaces -= 1;
        shared.ledger.released.surfaces += 1;
        shared.surface_live_since = None;
    }
}

struct SyntheticFrameBuffer {
    shared: Arc<Mutex<SyntheticShared>>,
    metrics: DisplayMetrics,
    options: SyntheticOptions,
    closed: bool,
}

impl SyntheticFrameBuffer {
    fn render(&self) -> RawFrame {
        let (width, height) = self
            .options
            .frame_size
            .unwrap_or((self.metrics.width, self.metrics.height));
        let padding = self.options.row_padding_px;
        let row_stride = (width + padding) * RGBA_BYTES_PER_PIXEL;
        let mut data = Vec::with_capacity(row_stride as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&synthetic_pixel(x, y));
            }
            for _ in 0..padding {
                data.extend_from_slice(&PADDING_FILL);
            }
        }
        RawFrame {
            width,
            height,
            row_stride,
            pixel_stride: RGBA_BYTES_PER_PIXEL,
            data,
        }
    }
}

#[async_trait]
impl FrameBuffer for SyntheticFrameBuffer {
    async fn acquire_latest(&mut self) -> Result<Option<RawFrame>> {
        if self.closed {
            bail!("frame buffer is closed");
        }
        if self.options.starved {
            return Ok(None);
        }
        let settled = self
            .shared
            .lock()
            .expect("synthetic mirror mutex poisoned")
            .surface_live_since
            .is_some_and(|since| since.elapsed() >= self.options.settle);
        if !settled {
            return Ok(None);
        }
        Ok(Some(self.render()))
    }

    fn close(&mut self) {
        let mut shared = self.shared.lock().expect("synthetic mirror mutex poisoned");
        if self.closed {
            shared.ledger.double_releases += 1;
            return;
        }
        self.closed = true;
        shared.ledger.live.buffers -= 1;
        shared.ledger.released.buffers += 1;
    }
}

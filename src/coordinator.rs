use crate::authorization::{AuthorizationBroker, CaptureCredential, PermissionOutcome};
use crate::encode::{CropRegion, DEFAULT_JPEG_QUALITY, EncodedImage, encode_region};
use crate::error::CaptureError;
use crate::session::ScreenMirror;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    AwaitingPermission,
    PermissionGranted,
    Capturing,
    Encoding,
    Delivered,
    Failed,
}

/// Messages from the foreground side to the background capture unit.
#[derive(Debug, Clone)]
pub enum ServiceCommand {
    /// Overlay tap. `defer` postpones opening the session so the user can
    /// switch to the screen they want captured.
    Capture { defer: Option<Duration> },
    /// Ask for permission now without capturing.
    Enable,
    Grant(CaptureCredential),
    RevokeGrant,
    Stop,
}

#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    Started,
    StateChanged(CoordinatorState),
    Delivered {
        activation: u64,
        width: u32,
        height: u32,
        encoded_bytes: usize,
    },
    Failed {
        activation: u64,
        error: CaptureError,
    },
    Rejected {
        error: CaptureError,
    },
    Stopped,
}

/// Where coordinator events go. Cloned into every entry point that reports to
/// the UI; `close` detaches it when the hosting unit shuts down.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<CoordinatorEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<CoordinatorEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disconnected() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: CoordinatorEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    pub fn close(&mut self) {
        self.tx = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Wait between opening a session and harvesting its first frame.
    pub settle_delay: Duration,
    pub jpeg_quality: u8,
    /// Part of the display to keep; the whole display when `None`.
    pub crop: Option<CropRegion>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            crop: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub activations: u64,
    pub delivered: u64,
    pub failed: u64,
    pub rejected: u64,
}

enum Halt {
    Failed(CaptureError),
    Stopped,
}

impl From<CaptureError> for Halt {
    fn from(err: CaptureError) -> Self {
        Halt::Failed(err)
    }
}

/// Drives one activation at a time from tap to delivered image.
pub struct SessionCoordinator {
    broker: Arc<AuthorizationBroker>,
    mirror: ScreenMirror,
    delivery: mpsc::UnboundedSender<EncodedImage>,
    config: CoordinatorConfig,
    events: EventSink,
    state: CoordinatorState,
    summary: SessionSummary,
}

impl SessionCoordinator {
    pub fn new(
        broker: Arc<AuthorizationBroker>,
        mirror: ScreenMirror,
        delivery: mpsc::UnboundedSender<EncodedImage>,
        config: CoordinatorConfig,
        events: EventSink,
    ) -> Self {
        Self {
            broker,
            mirror,
            delivery,
            config,
            events,
            state: CoordinatorState::Idle,
            summary: SessionSummary::default(),
        }
    }

    /// Serves commands until `Stop` arrives or every sender is gone. Any open
    /// session is closed before this returns.
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<ServiceCommand>,
    ) -> SessionSummary {
        self.events.emit(CoordinatorEvent::Started);

        while let Some(command) = commands.recv().await {
            let (activation, outcome) = match command {
                ServiceCommand::Stop => break,
                ServiceCommand::Grant(credential) => {
                    self.broker.adopt(credential);
                    continue;
                }
                ServiceCommand::RevokeGrant => {
                    self.broker.revoke();
                    continue;
                }
                ServiceCommand::Enable => {
                    let activation = self.begin_activation();
                    let outcome = self.authorize(&mut commands).await.map(|_| None);
                    (activation, outcome)
                }
                ServiceCommand::Capture { defer } => {
                    let activation = self.begin_activation();
                    let outcome = self.capture(defer, &mut commands).await.map(Some);
                    (activation, outcome)
                }
            };

            match outcome {
                Ok(Some(image)) => self.deliver(activation, image),
                Ok(None) => {}
                Err(Halt::Failed(error)) => self.fail(activation, error),
                Err(Halt::Stopped) => {
                    log::info!("activation {activation} interrupted by stop");
                    break;
                }
            }
            self.enter(CoordinatorState::Idle);
        }

        self.enter(CoordinatorState::Idle);
        self.events.emit(CoordinatorEvent::Stopped);
        self.events.close();
        self.summary
    }

    fn begin_activation(&mut self) -> u64 {
        self.summary.activations += 1;
        self.summary.activations
    }

    fn enter(&mut self, next: CoordinatorState) {
        if self.state == next {
            return;
        }
        log::debug!("coordinator {:?} -> {next:?}", self.state);
        self.state = next;
        self.events.emit(CoordinatorEvent::StateChanged(next));
    }

    async fn authorize(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<ServiceCommand>,
    ) -> Result<CaptureCredential, Halt> {
        if let Some(credential) = self.broker.active_credential() {
            self.enter(CoordinatorState::PermissionGranted);
            return Ok(credential);
        }

        self.enter(CoordinatorState::AwaitingPermission);
        let outcome = until_stopped(
            self.broker.request_capture_permission(),
            commands,
            &self.broker,
            &self.events,
            &mut self.summary,
        )
        .await
        .ok_or(Halt::Stopped)?;

        match outcome {
            PermissionOutcome::Granted(credential) => {
                self.enter(CoordinatorState::PermissionGranted);
                Ok(credential)
            }
            PermissionOutcome::Denied => Err(CaptureError::PermissionDenied.into()),
        }
    }

    async fn capture(
        &mut self,
        defer: Option<Duration>,
        commands: &mut mpsc::UnboundedReceiver<ServiceCommand>,
    ) -> Result<EncodedImage, Halt> {
        let credential = self.authorize(commands).await?;

        if let Some(defer) = defer.filter(|defer| !defer.is_zero()) {
            log::debug!("deferring capture by {defer:?}");
            self.wait(tokio::time::sleep(defer), commands).await?;
        }

        let metrics = self.mirror.display_metrics()?;
        let mut session = self.mirror.open(&credential, metrics)?;
        self.enter(CoordinatorState::Capturing);

        self.wait(tokio::time::sleep(self.config.settle_delay), commands)
            .await?;
        let harvested = self.wait(session.harvest_frame(), commands).await?;
        session.close();
        let frame = harvested?;

        self.enter(CoordinatorState::Encoding);
        let (quality, crop) = (self.config.jpeg_quality, self.config.crop);
        let encoding = async move {
            match tokio::task::spawn_blocking(move || encode_region(frame, crop, quality)).await {
                Ok(result) => result,
                Err(err) => Err(CaptureError::encoding(format!("encoder task failed: {err}"))),
            }
        };
        let image = self.wait(encoding, commands).await??;

        if crop.is_none() && (image.width(), image.height()) != (metrics.width, metrics.height) {
            return Err(CaptureError::encoding(format!(
                "encoded {}x{} for a {}x{} display",
                image.width(),
                image.height(),
                metrics.width,
                metrics.height
            ))
            .into());
        }
        Ok(image)
    }

    async fn wait<F: Future>(
        &mut self,
        work: F,
        commands: &mut mpsc::UnboundedReceiver<ServiceCommand>,
    ) -> Result<F::Output, Halt> {
        until_stopped(
            work,
            commands,
            &self.broker,
            &self.events,
            &mut self.summary,
        )
        .await
        .ok_or(Halt::Stopped)
    }

    fn deliver(&mut self, activation: u64, image: EncodedImage) {
        let (width, height, encoded_bytes) = (image.width(), image.height(), image.len());
        if self.delivery.send(image).is_err() {
            self.fail(
                activation,
                CaptureError::unavailable("image consumer is no longer listening"),
            );
            return;
        }

        self.summary.delivered += 1;
        self.enter(CoordinatorState::Delivered);
        log::info!("activation {activation} delivered {width}x{height} ({encoded_bytes} bytes)");
        self.events.emit(CoordinatorEvent::Delivered {
            activation,
            width,
            height,
            encoded_bytes,
        });
    }

    fn fail(&mut self, activation: u64, error: CaptureError) {
        self.summary.failed += 1;
        self.enter(CoordinatorState::Failed);
        log::warn!("activation {activation} failed: {error}");
        self.events
            .emit(CoordinatorEvent::Failed { activation, error });
    }
}

/// Runs `work` while still serving commands. Returns `None` when the unit is
/// told to stop (or its command channel closes) before `work` completes.
async fn until_stopped<F: Future>(
    work: F,
    commands: &mut mpsc::UnboundedReceiver<ServiceCommand>,
    broker: &AuthorizationBroker,
    events: &EventSink,
    summary: &mut SessionSummary,
) -> Option<F::Output> {
    tokio::pin!(work);
    loop {
        tokio::select! {
            biased;
            output = &mut work => return Some(output),
            command = commands.recv() => match command {
                None | Some(ServiceCommand::Stop) => return None,
                Some(ServiceCommand::Capture { .. }) | Some(ServiceCommand::Enable) => {
                    summary.rejected += 1;
                    events.emit(CoordinatorEvent::Rejected {
                        error: CaptureError::unavailable("a capture is already in progress"),
                    });
                }
                Some(ServiceCommand::Grant(credential)) => broker.adopt(credential),
                Some(ServiceCommand::RevokeGrant) => broker.revoke(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        CoordinatorConfig, CoordinatorEvent, CoordinatorState, EventSink, ServiceCommand,
        SessionCoordinator,
    };
    use crate::authorization::{
        AuthorizationBroker, CaptureCredential, PermissionResponse, StaticPermissionPrompt,
    };
    use crate::encode::{CropRegion, EncodedImage};
    use crate::error::CaptureError;
    use crate::mirror::{DisplayMetrics, SyntheticMirror};
    use crate::session::{ScreenMirror, SessionGate};
    use base64::{Engine as _, engine::general_purpose};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const METRICS: DisplayMetrics = DisplayMetrics {
        width: 64,
        height: 48,
        density_dpi: 420,
    };

    struct Rig {
        coordinator: SessionCoordinator,
        broker: Arc<AuthorizationBroker>,
        images: mpsc::UnboundedReceiver<EncodedImage>,
        events: mpsc::UnboundedReceiver<CoordinatorEvent>,
    }

    fn rig(platform: &SyntheticMirror, prompt: StaticPermissionPrompt, settle: Duration) -> Rig {
        let config = CoordinatorConfig {
            settle_delay: settle,
            jpeg_quality: 90,
            crop: None,
        };
        rig_with_config(platform, prompt, config)
    }

    fn rig_with_config(
        platform: &SyntheticMirror,
        prompt: StaticPermissionPrompt,
        config: CoordinatorConfig,
    ) -> Rig {
        let broker = Arc::new(AuthorizationBroker::new(Arc::new(prompt)));
        let mirror = ScreenMirror::new(Arc::new(platform.clone()), SessionGate::new());
        let (image_tx, images) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let coordinator = SessionCoordinator::new(
            broker.clone(),
            mirror,
            image_tx,
            config,
            EventSink::new(event_tx),
        );
        Rig {
            coordinator,
            broker,
            images,
            events,
        }
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<CoordinatorEvent>) -> Vec<CoordinatorEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn states(events: &[CoordinatorEvent]) -> Vec<CoordinatorState> {
        events
            .iter()
            .filter_map(|event| match event {
                CoordinatorEvent::StateChanged(state) => Some(*state),
                _ => None,
            })
            .collect()
    }

    fn failures(events: &[CoordinatorEvent]) -> Vec<CaptureError> {
        events
            .iter()
            .filter_map(|event| match event {
                CoordinatorEvent::Failed { error, .. } => Some(error.clone()),
                _ => None,
            })
            .collect()
    }

    /// Collects events up to and including the return to `Idle`.
    async fn until_idle(
        events: &mut mpsc::UnboundedReceiver<CoordinatorEvent>,
    ) -> Vec<CoordinatorEvent> {
        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            let idle = matches!(event, CoordinatorEvent::StateChanged(CoordinatorState::Idle));
            seen.push(event);
            if idle {
                break;
            }
        }
        seen
    }

    fn credential() -> CaptureCredential {
        CaptureCredential::from_response(PermissionResponse::granted("granted-earlier"))
            .expect("grant")
    }

    #[tokio::test]
    async fn tap_without_grant_prompts_captures_and_delivers() {
        let platform = SyntheticMirror::new(METRICS).with_row_padding(8);
        let Rig {
            coordinator,
            mut images,
            mut events,
            ..
        } = rig(
            &platform,
            StaticPermissionPrompt::granting(),
            Duration::from_millis(20),
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(coordinator.run(rx));
        tx.send(ServiceCommand::Capture { defer: None })
            .expect("capture");

        let image = images.recv().await.expect("delivered image");
        tx.send(ServiceCommand::Stop).expect("stop");
        let summary = task.await.expect("join");

        assert_eq!(summary.activations, 1);
        assert_eq!(summary.delivered, 1);
        assert_eq!(summary.failed, 0);

        assert!(!image.is_empty());
        let bytes = general_purpose::STANDARD
            .decode(image.as_base64())
            .expect("base64");
        let decoded = image::load_from_memory(&bytes).expect("jpeg");
        assert_eq!((decoded.width(), decoded.height()), (64, 48));

        let events = drain(&mut events);
        assert_eq!(
            states(&events),
            vec![
                CoordinatorState::AwaitingPermission,
                CoordinatorState::PermissionGranted,
                CoordinatorState::Capturing,
                CoordinatorState::Encoding,
                CoordinatorState::Delivered,
                CoordinatorState::Idle,
            ]
        );
        assert!(matches!(events.last(), Some(CoordinatorEvent::Stopped)));
        assert!(platform.ledger().live.is_empty());
        assert!(images.try_recv().is_err());
    }

    #[tokio::test]
    async fn missing_frame_releases_everything_and_returns_to_idle() {
        let platform = SyntheticMirror::new(METRICS).starved();
        let prompt = StaticPermissionPrompt::denying();
        let Rig {
            coordinator,
            broker,
            mut images,
            mut events,
        } = rig(&platform, prompt, Duration::from_millis(10));
        broker.adopt(credential());

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(coordinator.run(rx));
        tx.send(ServiceCommand::Capture { defer: None })
            .expect("capture");
        let events = until_idle(&mut events).await;
        tx.send(ServiceCommand::Stop).expect("stop");
        let summary = task.await.expect("join");

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.delivered, 0);

        let ledger = platform.ledger();
        assert!(ledger.live.is_empty());
        assert_eq!(ledger.released.handles, 1);
        assert_eq!(ledger.released.surfaces, 1);
        assert_eq!(ledger.released.buffers, 1);
        assert_eq!(ledger.double_releases, 0);

        assert_eq!(
            states(&events),
            vec![
                CoordinatorState::PermissionGranted,
                CoordinatorState::Capturing,
                CoordinatorState::Failed,
                CoordinatorState::Idle,
            ]
        );
        assert_eq!(failures(&events), vec![CaptureError::NoFrameAvailable]);
        assert!(images.recv().await.is_none());
    }

    #[tokio::test]
    async fn denial_fails_without_touching_the_display() {
        let platform = SyntheticMirror::new(METRICS);
        let Rig {
            coordinator,
            mut events,
            ..
        } = rig(
            &platform,
            StaticPermissionPrompt::denying(),
            Duration::from_millis(10),
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(coordinator.run(rx));
        tx.send(ServiceCommand::Capture { defer: None })
            .expect("capture");
        let events = until_idle(&mut events).await;
        drop(tx);
        let summary = task.await.expect("join");

        assert_eq!(summary.failed, 1);
        assert_eq!(platform.ledger().opened.total(), 0);
        assert_eq!(
            states(&events),
            vec![
                CoordinatorState::AwaitingPermission,
                CoordinatorState::Failed,
                CoordinatorState::Idle,
            ]
        );
        assert_eq!(failures(&events), vec![CaptureError::PermissionDenied]);
    }

    #[tokio::test]
    async fn second_tap_during_capture_is_rejected() {
        let platform = SyntheticMirror::new(METRICS);
        let Rig {
            coordinator,
            mut images,
            mut events,
            ..
        } = rig(
            &platform,
            StaticPermissionPrompt::granting(),
            Duration::from_millis(150),
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(coordinator.run(rx));
        tx.send(ServiceCommand::Capture { defer: None })
            .expect("capture");
        tx.send(ServiceCommand::Capture { defer: None })
            .expect("second capture");

        images.recv().await.expect("first image");
        tx.send(ServiceCommand::Stop).expect("stop");
        let summary = task.await.expect("join");

        assert_eq!(summary.activations, 1);
        assert_eq!(summary.delivered, 1);
        assert_eq!(summary.rejected, 1);
        assert!(drain(&mut events).iter().any(|event| matches!(
            event,
            CoordinatorEvent::Rejected {
                error: CaptureError::ResourceUnavailable(_)
            }
        )));
    }

    #[tokio::test]
    async fn stop_during_settle_tears_down_before_returning() {
        let platform = SyntheticMirror::new(METRICS);
        let Rig {
            coordinator,
            mut events,
            ..
        } = rig(
            &platform,
            StaticPermissionPrompt::granting(),
            Duration::from_secs(30),
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(coordinator.run(rx));
        tx.send(ServiceCommand::Capture { defer: None })
            .expect("capture");

        while let Some(event) = events.recv().await {
            if matches!(
                event,
                CoordinatorEvent::StateChanged(CoordinatorState::Capturing)
            ) {
                break;
            }
        }
        assert_eq!(platform.ledger().live.total(), 3);

        tx.send(ServiceCommand::Stop).expect("stop");
        let summary = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("stops promptly")
            .expect("join");

        assert_eq!(summary.delivered, 0);
        assert!(platform.ledger().live.is_empty());
    }

    #[tokio::test]
    async fn grant_reuse_and_revocation() {
        let platform = SyntheticMirror::new(METRICS);
        let Rig {
            coordinator,
            mut images,
            mut events,
            ..
        } = rig(
            &platform,
            StaticPermissionPrompt::denying(),
            Duration::from_millis(10),
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(coordinator.run(rx));
        tx.send(ServiceCommand::Grant(credential())).expect("grant");
        tx.send(ServiceCommand::Capture { defer: None })
            .expect("capture");
        images.recv().await.expect("image from adopted grant");

        until_idle(&mut events).await;

        tx.send(ServiceCommand::Grant(credential())).expect("grant");
        tx.send(ServiceCommand::RevokeGrant).expect("revoke");
        tx.send(ServiceCommand::Capture { defer: None })
            .expect("capture");
        let after_revoke = until_idle(&mut events).await;
        tx.send(ServiceCommand::Stop).expect("stop");
        let summary = task.await.expect("join");

        assert_eq!(summary.delivered, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(failures(&after_revoke), vec![CaptureError::PermissionDenied]);
        assert_eq!(platform.ledger().opened.handles, 1);
    }

    #[tokio::test]
    async fn enable_only_obtains_a_grant() {
        let platform = SyntheticMirror::new(METRICS);
        let Rig {
            coordinator,
            broker,
            mut events,
            ..
        } = rig(
            &platform,
            StaticPermissionPrompt::granting(),
            Duration::from_millis(10),
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(coordinator.run(rx));
        tx.send(ServiceCommand::Enable).expect("enable");
        let seen = until_idle(&mut events).await;
        tx.send(ServiceCommand::Stop).expect("stop");
        let summary = task.await.expect("join");

        assert_eq!(summary.delivered, 0);
        assert_eq!(summary.failed, 0);
        assert!(broker.has_active_grant());
        assert_eq!(platform.ledger().opened.total(), 0);
        assert_eq!(
            states(&seen),
            vec![
                CoordinatorState::AwaitingPermission,
                CoordinatorState::PermissionGranted,
                CoordinatorState::Idle,
            ]
        );
    }

    #[tokio::test]
    async fn closed_consumer_fails_the_activation() {
        let platform = SyntheticMirror::new(METRICS);
        let Rig {
            coordinator,
            images,
            mut events,
            ..
        } = rig(
            &platform,
            StaticPermissionPrompt::granting(),
            Duration::from_millis(10),
        );
        drop(images);

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(coordinator.run(rx));
        tx.send(ServiceCommand::Capture { defer: None })
            .expect("capture");
        let seen = until_idle(&mut events).await;
        tx.send(ServiceCommand::Stop).expect("stop");
        let summary = task.await.expect("join");

        assert_eq!(summary.failed, 1);
        assert!(matches!(
            failures(&seen).as_slice(),
            [CaptureError::ResourceUnavailable(_)]
        ));
        assert!(platform.ledger().live.is_empty());
    }

    #[tokio::test]
    async fn frames_larger_than_the_declared_display_are_never_delivered() {
        let platform = SyntheticMirror::new(METRICS).with_frame_size(128, 96);
        let Rig {
            coordinator,
            mut images,
            mut events,
            ..
        } = rig(
            &platform,
            StaticPermissionPrompt::granting(),
            Duration::from_millis(10),
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(coordinator.run(rx));
        tx.send(ServiceCommand::Capture { defer: None })
            .expect("capture");
        let seen = until_idle(&mut events).await;
        tx.send(ServiceCommand::Stop).expect("stop");
        let summary = task.await.expect("join");

        assert_eq!(summary.delivered, 0);
        assert_eq!(summary.failed, 1);
        assert!(matches!(
            failures(&seen).as_slice(),
            [CaptureError::ResourceUnavailable(message)] if message.contains("128x96")
        ));
        assert!(!states(&seen).contains(&CoordinatorState::Encoding));
        assert!(images.recv().await.is_none());
        assert!(platform.ledger().live.is_empty());
    }

    #[tokio::test]
    async fn configured_crop_region_is_applied_before_delivery() {
        let platform = SyntheticMirror::new(METRICS).with_row_padding(4);
        let config = CoordinatorConfig {
            settle_delay: Duration::from_millis(10),
            jpeg_quality: 90,
            crop: Some(CropRegion {
                x: 16,
                y: 8,
                width: 32,
                height: 24,
            }),
        };
        let Rig {
            coordinator,
            mut images,
            mut events,
            ..
        } = rig_with_config(&platform, StaticPermissionPrompt::granting(), config);

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(coordinator.run(rx));
        tx.send(ServiceCommand::Capture { defer: None })
            .expect("capture");
        let image = images.recv().await.expect("cropped image");
        until_idle(&mut events).await;
        tx.send(ServiceCommand::Stop).expect("stop");
        task.await.expect("join");

        assert_eq!((image.width(), image.height()), (32, 24));
        let decoded = image::load_from_memory(image.bytes()).expect("jpeg");
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
    }
}

use anyhow::{Context, Result};
use global_hotkey::hotkey::{Code, HotKey, Modifiers};
use global_hotkey::{GlobalHotKeyEvent, GlobalHotKeyManager, HotKeyState};
use opener::open;
use snaplens::analysis::{
    AnalysisEvent, ImageConsumer, MetadataAnalyzer, VisionAnalyzer, spawn_analysis_worker,
};
use snaplens::answer_log::AnswerLog;
use snaplens::authorization::{AuthorizationBroker, MacOsPermissionPrompt};
use snaplens::coordinator::{CoordinatorEvent, CoordinatorState, EventSink, SessionCoordinator};
use snaplens::mirror::ScreencaptureMirror;
use snaplens::overlay::{
    GesturePhase, OverlayAction, OverlayController, OverlayPosition, OverlayPositionStore, TouchEvent,
};
use snaplens::paths::{default_answer_log_path, default_overlay_state_path, default_settings_path};
use snaplens::permission_watch::spawn_permission_watch;
use snaplens::permissions::{
    ScreenRecordingStatus, open_screen_recording_settings, screen_recording_help_message,
    screen_recording_status,
};
use snaplens::review::{ReviewCommand, ReviewDesk, ReviewEvent, spawn_review_stage};
use snaplens::service::{CaptureService, DesktopForegroundHost, ServiceHandle};
use snaplens::session::{ScreenMirror, SessionGate};
use snaplens::settings::{Settings, ensure_sample_settings};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tao::dpi::{LogicalSize, PhysicalPosition};
use tao::event::{ElementState, Event, MouseButton, StartCause, WindowEvent};
use tao::event_loop::{ControlFlow, EventLoopBuilder, EventLoopProxy};
use tao::window::{Window, WindowBuilder};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tray_icon::menu::{Menu, MenuEvent, MenuItem, PredefinedMenuItem};
use tray_icon::{Icon, TrayIcon, TrayIconBuilder};

const OVERLAY_SIZE: f64 = 56.0;

#[derive(Debug, Clone)]
enum UserEvent {
    Menu(MenuEvent),
    Hotkey(GlobalHotKeyEvent),
    Status { text: String, indicator: Indicator },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Indicator {
    Hidden,
    Ready,
    Busy,
    Error,
}

/// One SHOW/START of the capture service with its review stage.
struct Unit {
    service: ServiceHandle,
    review: mpsc::UnboundedSender<ReviewCommand>,
}

struct AppState {
    runtime: Runtime,
    settings: Settings,
    unit: Option<Unit>,
    controller: OverlayController,
    store: OverlayPositionStore,
    cursor: (f64, f64),
}

impl AppState {
    fn is_shown(&self) -> bool {
        self.unit
            .as_ref()
            .is_some_and(|unit| unit.service.is_running())
    }

    fn review(&self, command: ReviewCommand, proxy: &EventLoopProxy<UserEvent>) {
        let sent = self
            .unit
            .as_ref()
            .is_some_and(|unit| unit.review.send(command).is_ok());
        if !sent {
            notify(proxy, "Show the overlay first.".to_string(), Indicator::Hidden);
        }
    }

    fn save_position(&self) {
        if let Err(err) = self.store.save(self.controller.position()) {
            log::warn!("failed to remember overlay position: {err:#}");
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    let event_loop = EventLoopBuilder::<UserEvent>::with_user_event().build();
    let proxy = event_loop.create_proxy();

    let proxy_for_menu = proxy.clone();
    MenuEvent::set_event_handler(Some(move |event| {
        let _ = proxy_for_menu.send_event(UserEvent::Menu(event));
    }));

    let mut startup_notice: Option<String> = None;
    let settings = match Settings::load(&default_settings_path()) {
        Ok(settings) => settings.with_env_overrides(),
        Err(err) => {
            startup_notice = Some(format!("Settings ignored: {err:#}"));
            Settings::default().with_env_overrides()
        }
    };

    let store = OverlayPositionStore::new(default_overlay_state_path());
    let position = store.load().unwrap_or_else(|err| {
        log::warn!("failed to restore overlay position: {err:#}");
        Default::default()
    });

    let window = WindowBuilder::new()
        .with_title("snaplens")
        .with_decorations(false)
        .with_always_on_top(true)
        .with_resizable(false)
        .with_inner_size(LogicalSize::new(OVERLAY_SIZE, OVERLAY_SIZE))
        .with_position(PhysicalPosition::new(position.x, position.y))
        .with_visible(false)
        .build(&event_loop)
        .context("failed to create overlay window")?;

    let mut app = AppState {
        runtime,
        settings,
        unit: None,
        controller: OverlayController::new(position),
        store,
        cursor: (0.0, 0.0),
    };

    let hotkey_manager = match GlobalHotKeyManager::new() {
        Ok(manager) => Some(manager),
        Err(err) => {
            startup_notice = Some(format!("Global hotkey init failed: {err}"));
            None
        }
    };

    if screen_recording_status().needs_user_action() {
        startup_notice = Some(screen_recording_help_message().to_string());
    }

    let mut hotkey_id = None;
    if let Some(manager) = hotkey_manager.as_ref() {
        let capture_hotkey = HotKey::new(Some(Modifiers::ALT), Code::KeyS);
        let id = capture_hotkey.id();
        match manager.register(capture_hotkey) {
            Ok(()) => hotkey_id = Some(id),
            Err(err) => {
                startup_notice = Some(format!("Failed to register hotkey Option+S: {err}"));
            }
        }
    }

    let proxy_for_hotkey = proxy.clone();
    GlobalHotKeyEvent::set_event_handler(Some(move |event| {
        let _ = proxy_for_hotkey.send_event(UserEvent::Hotkey(event));
    }));

    let status_item = MenuItem::new("Status: Starting", false, None);
    let show_item = MenuItem::new("Show overlay", true, None);
    let hide_item = MenuItem::new("Hide overlay", false, None);
    let capture_item = MenuItem::new("Capture now (Option+S)", false, None);
    let capture_later_item = MenuItem::new("Capture after a short delay", false, None);
    let send_item = MenuItem::new("Send capture for analysis", false, None);
    let discard_item = MenuItem::new("Discard capture", false, None);
    let reanalyze_item = MenuItem::new("Analyze again", false, None);
    let enable_item = MenuItem::new("Request screen capture permission", false, None);
    let permission_settings_item = MenuItem::new("Open Screen Recording Settings...", true, None);
    let open_answers_item = MenuItem::new("Open answers", true, None);
    let open_settings_item = MenuItem::new("Open settings...", true, None);
    let quit_item = MenuItem::new("Quit", true, None);

    let menu = Menu::new();
    menu.append(&status_item)?;
    menu.append(&PredefinedMenuItem::separator())?;
    menu.append(&show_item)?;
    menu.append(&hide_item)?;
    menu.append(&PredefinedMenuItem::separator())?;
    menu.append(&capture_item)?;
    menu.append(&capture_later_item)?;
    menu.append(&send_item)?;
    menu.append(&discard_item)?;
    menu.append(&reanalyze_item)?;
    menu.append(&PredefinedMenuItem::separator())?;
    menu.append(&enable_item)?;
    menu.append(&permission_settings_item)?;
    menu.append(&PredefinedMenuItem::separator())?;
    menu.append(&open_answers_item)?;
    menu.append(&open_settings_item)?;
    menu.append(&PredefinedMenuItem::separator())?;
    menu.append(&quit_item)?;

    let controls = ServiceControls {
        show: show_item.clone(),
        gated: vec![
            hide_item.clone(),
            capture_item.clone(),
            capture_later_item.clone(),
            send_item.clone(),
            discard_item.clone(),
            reanalyze_item.clone(),
            enable_item.clone(),
        ],
    };

    let icons = IconSet::new();
    let mut tray_icon = None;

    event_loop.run(move |event, _target, control_flow| {
        *control_flow = ControlFlow::Wait;

        match event {
            Event::NewEvents(StartCause::Init) => {
                if tray_icon.is_none() {
                    let built = TrayIconBuilder::new()
                        .with_menu(Box::new(menu.clone()))
                        .with_tooltip("snaplens")
                        .with_title("SL")
                        .with_icon(icons.icon(Indicator::Hidden))
                        .build();

                    if let Ok(icon) = built {
                        tray_icon = Some(icon);
                    } else {
                        status_item.set_text("Status: Failed to init tray icon");
                    }
                }

                show_overlay(&mut app, &window, &proxy);
                if let Some(notice) = startup_notice.take() {
                    set_status(&status_item, &mut tray_icon, &icons, &notice, Indicator::Error);
                }
                refresh_controls(&app, &controls);
            }
            Event::WindowEvent {
                event: window_event,
                ..
            } => match window_event {
                WindowEvent::Moved(position) => {
                    if app.controller.phase() != GesturePhase::Tracking {
                        app.controller.place(OverlayPosition {
                            x: position.x,
                            y: position.y,
                        });
                    }
                }
                WindowEvent::CursorMoved { position, .. } => {
                    app.cursor = raw_point(&window, position);
                    let (raw_x, raw_y) = app.cursor;
                    let action = app.controller.handle(TouchEvent::Move { raw_x, raw_y });
                    apply_overlay_action(&mut app, &window, action);
                }
                WindowEvent::MouseInput {
                    state,
                    button: MouseButton::Left,
                    ..
                } => {
                    let touch = match state {
                        ElementState::Pressed => TouchEvent::Start {
                            raw_x: app.cursor.0,
                            raw_y: app.cursor.1,
                            at: Instant::now(),
                        },
                        _ => TouchEvent::End { at: Instant::now() },
                    };
                    let action = app.controller.handle(touch);
                    apply_overlay_action(&mut app, &window, action);
                }
                _ => {}
            },
            Event::UserEvent(UserEvent::Hotkey(hotkey_event)) => {
                let matches = hotkey_id.as_ref().is_some_and(|id| hotkey_event.id == *id);
                if matches && hotkey_event.state == HotKeyState::Pressed {
                    request_capture(&app, None, &proxy);
                }
            }
            Event::UserEvent(UserEvent::Menu(menu_event)) => {
                if menu_event.id == show_item.id() {
                    show_overlay(&mut app, &window, &proxy);
                } else if menu_event.id == hide_item.id() {
                    hide_overlay(&mut app, &window);
                    set_status(&status_item, &mut tray_icon, &icons, "Overlay hidden", Indicator::Hidden);
                } else if menu_event.id == capture_item.id() {
                    request_capture(&app, None, &proxy);
                } else if menu_event.id == capture_later_item.id() {
                    let delay = app.settings.capture.redirect_delay();
                    request_capture(&app, Some(delay), &proxy);
                } else if menu_event.id == send_item.id() {
                    app.review(ReviewCommand::Confirm, &proxy);
                } else if menu_event.id == discard_item.id() {
                    app.review(ReviewCommand::Discard, &proxy);
                } else if menu_event.id == reanalyze_item.id() {
                    app.review(ReviewCommand::Reanalyze, &proxy);
                } else if menu_event.id == enable_item.id() {
                    if let Some(unit) = &app.unit
                        && let Err(err) = unit.service.enable()
                    {
                        notify(&proxy, err.user_message().to_string(), Indicator::Error);
                    }
                } else if menu_event.id == permission_settings_item.id() {
                    match open_screen_recording_settings() {
                        Ok(()) => notify(
                            &proxy,
                            "Opening Screen Recording settings...".to_string(),
                            Indicator::Ready,
                        ),
                        Err(err) => notify(
                            &proxy,
                            format!("Failed to open System Settings: {err}"),
                            Indicator::Error,
                        ),
                    }
                } else if menu_event.id == open_answers_item.id() {
                    open_path(default_answer_log_path(), &proxy);
                } else if menu_event.id == open_settings_item.id() {
                    let path = default_settings_path();
                    if let Err(err) = ensure_sample_settings(&path) {
                        notify(&proxy, format!("Settings error: {err:#}"), Indicator::Error);
                    }
                    open_path(path, &proxy);
                } else if menu_event.id == quit_item.id() {
                    hide_overlay(&mut app, &window);
                    *control_flow = ControlFlow::Exit;
                }
                refresh_controls(&app, &controls);
            }
            Event::UserEvent(UserEvent::Status { text, indicator }) => {
                let indicator = if app.is_shown() {
                    indicator
                } else {
                    Indicator::Hidden
                };
                set_status(&status_item, &mut tray_icon, &icons, &text, indicator);
            }
            _ => {}
        }
    });
}

/// Window-relative cursor position to screen coordinates, which stay stable
/// while the window itself is being dragged.
fn raw_point(window: &Window, cursor: PhysicalPosition<f64>) -> (f64, f64) {
    let (x, y) = window
        .outer_position()
        .map(|origin| (origin.x as f64, origin.y as f64))
        .unwrap_or((0.0, 0.0));
    (x + cursor.x, y + cursor.y)
}

fn apply_overlay_action(app: &mut AppState, window: &Window, action: OverlayAction) {
    match action {
        OverlayAction::None => {}
        OverlayAction::MoveTo(position) => {
            window.set_outer_position(PhysicalPosition::new(position.x, position.y));
        }
        OverlayAction::DragFinished(_) => app.save_position(),
        OverlayAction::Tap => {
            if let Some(unit) = &app.unit
                && let Err(err) = unit.service.tap()
            {
                log::warn!("overlay tap dropped: {err}");
            }
        }
    }
}

fn request_capture(app: &AppState, defer: Option<Duration>, proxy: &EventLoopProxy<UserEvent>) {
    let Some(unit) = &app.unit else {
        notify(proxy, "Show the overlay first.".to_string(), Indicator::Hidden);
        return;
    };
    if let Err(err) = unit.service.capture(defer) {
        notify(proxy, err.user_message().to_string(), Indicator::Error);
    }
}

fn show_overlay(app: &mut AppState, window: &Window, proxy: &EventLoopProxy<UserEvent>) {
    if app.is_shown() {
        return;
    }
    match start_unit(&app.runtime, &app.settings, proxy) {
        Ok(unit) => {
            app.unit = Some(unit);
            let position = app.controller.position();
            window.set_outer_position(PhysicalPosition::new(position.x, position.y));
            window.set_visible(true);
        }
        Err(err) => notify(
            proxy,
            format!("Could not start capture service: {err:#}"),
            Indicator::Error,
        ),
    }
}

fn hide_overlay(app: &mut AppState, window: &Window) {
    window.set_visible(false);
    app.save_position();
    if let Some(Unit { service, review }) = app.unit.take() {
        drop(review);
        match app.runtime.block_on(service.stop()) {
            Ok(summary) => log::info!(
                "capture service stopped after {} activations ({} delivered)",
                summary.activations,
                summary.delivered
            ),
            Err(err) => log::warn!("capture service did not stop cleanly: {err:#}"),
        }
    }
}

/// SHOW/START: spins up the analysis worker, the coordinator and the
/// forwarders that turn their events into tray status updates.
fn start_unit(
    runtime: &Runtime,
    settings: &Settings,
    proxy: &EventLoopProxy<UserEvent>,
) -> Result<Unit> {
    let consumer = build_consumer(settings)?;
    let _guard = runtime.enter();

    let (submit_tx, submit_rx) = mpsc::unbounded_channel();
    let (answer_tx, mut answer_rx) = mpsc::unbounded_channel();
    spawn_analysis_worker(
        submit_rx,
        consumer,
        Some(AnswerLog::new(default_answer_log_path())),
        Some(answer_tx),
    );

    let (image_tx, image_rx) = mpsc::unbounded_channel();
    let (review, review_rx) = mpsc::unbounded_channel();
    let (review_event_tx, mut review_events) = mpsc::unbounded_channel();
    spawn_review_stage(
        image_rx,
        review_rx,
        ReviewDesk::new(settings.analysis.review, settings.capture.jpeg_quality),
        submit_tx,
        Some(review_event_tx),
    );

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let coordinator = SessionCoordinator::new(
        Arc::new(AuthorizationBroker::new(Arc::new(MacOsPermissionPrompt))),
        ScreenMirror::new(Arc::new(ScreencaptureMirror), SessionGate::new()),
        image_tx,
        settings.coordinator_config(),
        EventSink::new(event_tx),
    );
    let service = CaptureService::start(Arc::new(DesktopForegroundHost), coordinator, None)?;

    let proxy_events = proxy.clone();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if let Some((text, indicator)) = describe_event(&event) {
                let _ = proxy_events.send_event(UserEvent::Status { text, indicator });
            }
        }
    });

    let proxy_reviews = proxy.clone();
    tokio::spawn(async move {
        while let Some(event) = review_events.recv().await {
            let (text, indicator) = describe_review(&event);
            let _ = proxy_reviews.send_event(UserEvent::Status { text, indicator });
        }
    });

    let proxy_answers = proxy.clone();
    tokio::spawn(async move {
        while let Some(event) = answer_rx.recv().await {
            let (text, indicator) = match event {
                AnalysisEvent::Answered { sequence, answer } => {
                    log::info!("answer #{sequence}:\n{answer}");
                    (
                        format!("Answer #{sequence} ready (Open answers)"),
                        Indicator::Ready,
                    )
                }
                AnalysisEvent::Failed { sequence, message } => {
                    (format!("Answer #{sequence} failed: {message}"), Indicator::Error)
                }
            };
            let _ = proxy_answers.send_event(UserEvent::Status { text, indicator });
        }
    });

    let proxy_permission = proxy.clone();
    let _ = spawn_permission_watch(service.commands(), move |status| {
        let (text, indicator) = match status {
            ScreenRecordingStatus::Denied => (
                format!(
                    "Screen Recording permission revoked. {}",
                    screen_recording_help_message()
                ),
                Indicator::Error,
            ),
            ScreenRecordingStatus::Granted => (
                "Screen Recording permission restored.".to_string(),
                Indicator::Ready,
            ),
            ScreenRecordingStatus::NotSupported => return,
        };
        let _ = proxy_permission.send_event(UserEvent::Status { text, indicator });
    });

    Ok(Unit { service, review })
}

fn describe_event(event: &CoordinatorEvent) -> Option<(String, Indicator)> {
    let described = match event {
        CoordinatorEvent::Started => (
            "Ready. Tap the overlay to capture.".to_string(),
            Indicator::Ready,
        ),
        CoordinatorEvent::StateChanged(CoordinatorState::AwaitingPermission) => (
            "Waiting for screen capture permission...".to_string(),
            Indicator::Busy,
        ),
        CoordinatorEvent::StateChanged(CoordinatorState::Capturing) => {
            ("Capturing...".to_string(), Indicator::Busy)
        }
        CoordinatorEvent::StateChanged(CoordinatorState::Encoding) => {
            ("Encoding...".to_string(), Indicator::Busy)
        }
        CoordinatorEvent::StateChanged(_) => return None,
        CoordinatorEvent::Delivered {
            activation,
            width,
            height,
            ..
        } => (
            format!("Capture #{activation} taken ({width}x{height})"),
            Indicator::Busy,
        ),
        // A missed frame is worth another tap, not an alarm.
        CoordinatorEvent::Failed { error, .. } if error.suggests_retry() => {
            (error.user_message().to_string(), Indicator::Ready)
        }
        CoordinatorEvent::Failed { error, .. } => {
            (error.user_message().to_string(), Indicator::Error)
        }
        CoordinatorEvent::Rejected { error } => {
            (error.user_message().to_string(), Indicator::Busy)
        }
        CoordinatorEvent::Stopped => ("Overlay hidden".to_string(), Indicator::Hidden),
    };
    Some(described)
}

fn describe_review(event: &ReviewEvent) -> (String, Indicator) {
    match event {
        ReviewEvent::Pending {
            capture,
            width,
            height,
        } => (
            format!("Capture #{capture} ({width}x{height}) waiting. Send or discard it"),
            Indicator::Ready,
        ),
        ReviewEvent::Cropped {
            capture,
            width,
            height,
        } => (
            format!("Capture #{capture} cropped to {width}x{height}"),
            Indicator::Ready,
        ),
        ReviewEvent::Submitted { capture, .. } => (
            format!("Capture #{capture} sent for analysis"),
            Indicator::Busy,
        ),
        ReviewEvent::Discarded { capture } => {
            (format!("Capture #{capture} discarded"), Indicator::Ready)
        }
        ReviewEvent::Refused { error } => (error.to_string(), Indicator::Error),
    }
}

fn build_consumer(settings: &Settings) -> Result<Arc<dyn ImageConsumer>> {
    let Some(api_key) = settings.analysis.api_key() else {
        return Ok(Arc::new(MetadataAnalyzer));
    };
    let plan = settings.analysis.plan()?;
    Ok(Arc::new(VisionAnalyzer::with_plan(
        api_key,
        settings.analysis.normalized_base_url(),
        plan,
        settings.analysis.prompt.clone(),
    )))
}

fn notify(proxy: &EventLoopProxy<UserEvent>, text: String, indicator: Indicator) {
    let _ = proxy.send_event(UserEvent::Status { text, indicator });
}

/// Menu entries that only apply while the overlay is shown, plus the one that
/// shows it.
struct ServiceControls {
    show: MenuItem,
    gated: Vec<MenuItem>,
}

fn refresh_controls(app: &AppState, controls: &ServiceControls) {
    let shown = app.is_shown();
    controls.show.set_enabled(!shown);
    for item in &controls.gated {
        item.set_enabled(shown);
    }
}

fn set_status(
    status_item: &MenuItem,
    tray_icon: &mut Option<TrayIcon>,
    icons: &IconSet,
    text: &str,
    indicator: Indicator,
) {
    status_item.set_text(format!("Status: {text}"));
    if let Some(icon) = tray_icon.as_ref() {
        let _ = icon.set_icon(Some(icons.icon(indicator)));
    }
}

fn open_path(path: PathBuf, proxy: &EventLoopProxy<UserEvent>) {
    let result = if path.exists() {
        open(&path)
    } else {
        Err(opener::OpenError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "nothing recorded yet",
        )))
    };

    let (text, indicator) = match result {
        Ok(()) => (format!("Opened {}", path.display()), Indicator::Ready),
        Err(err) => (
            format!("Failed to open {}: {err}", path.display()),
            Indicator::Error,
        ),
    };
    notify(proxy, text, indicator);
}

struct IconSet {
    hidden: Icon,
    ready: Icon,
    busy: Icon,
    error: Icon,
}

impl IconSet {
    fn new() -> Self {
        Self {
            hidden: build_state_icon([160, 160, 160]),
            ready: build_state_icon([46, 204, 113]),
            busy: build_state_icon([52, 152, 219]),
            error: build_state_icon([231, 76, 60]),
        }
    }

    fn icon(&self, indicator: Indicator) -> Icon {
        match indicator {
            Indicator::Hidden => self.hidden.clone(),
            Indicator::Ready => self.ready.clone(),
            Indicator::Busy => self.busy.clone(),
            Indicator::Error => self.error.clone(),
        }
    }
}

fn build_state_icon(fill_rgb: [u8; 3]) -> Icon {
    let (width, height) = (18, 18);
    let mut rgba = Vec::with_capacity(width * height * 4);
    let border = [40, 40, 40, 255];
    let fill = [fill_rgb[0], fill_rgb[1], fill_rgb[2], 255];
    let background = [0, 0, 0, 0];

    for y in 0..height {
        for x in 0..width {
            let dx = x as i32 * 2 - (width as i32 - 1);
            let dy = y as i32 * 2 - (height as i32 - 1);
            let distance = dx * dx + dy * dy;
            let pixel = if distance <= 13 * 13 {
                fill
            } else if distance <= 17 * 17 {
                border
            } else {
                background
            };
            rgba.extend_from_slice(&pixel);
        }
    }

    Icon::from_rgba(rgba, width as u32, height as u32).expect("valid tray icon")
}

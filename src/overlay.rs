//! Floating overlay control: tap-versus-drag resolution and position memory.
//!
//! The controller is fed raw screen coordinates in arrival order by whatever
//! owns the window. It never talks to the capture pipeline directly; a resolved
//! tap is returned as [`OverlayAction::Tap`] and forwarded by the host.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Movement beyond this many pixels on either axis turns a gesture into a drag.
pub const TAP_SLOP_PX: f64 = 10.0;
/// A tap must be released within this long after contact.
pub const TAP_TIMEOUT: Duration = Duration::from_millis(300);
pub const DEFAULT_OVERLAY_POSITION: OverlayPosition = OverlayPosition { x: 100, y: 300 };

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayPosition {
    pub x: i32,
    pub y: i32,
}

impl Default for OverlayPosition {
    fn default() -> Self {
        DEFAULT_OVERLAY_POSITION
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TouchEvent {
    Start { raw_x: f64, raw_y: f64, at: Instant },
    Move { raw_x: f64, raw_y: f64 },
    End { at: Instant },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GesturePhase {
    Idle,
    Tracking,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayAction {
    None,
    MoveTo(OverlayPosition),
    Tap,
    DragFinished(OverlayPosition),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayState {
    pub position: OverlayPosition,
    pub dragging: bool,
    pub gesture_started: Option<Instant>,
    pub touch_origin: (f64, f64),
    pub window_origin: OverlayPosition,
}

impl OverlayState {
    fn at(position: OverlayPosition) -> Self {
        Self {
            position,
            dragging: false,
            gesture_started: None,
            touch_origin: (0.0, 0.0),
            window_origin: position,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OverlayController {
    state: OverlayState,
    phase: GesturePhase,
}

impl OverlayController {
    pub fn new(position: OverlayPosition) -> Self {
        Self {
            state: OverlayState::at(position),
            phase: GesturePhase::Idle,
        }
    }

    pub fn position(&self) -> OverlayPosition {
        self.state.position
    }

    pub fn phase(&self) -> GesturePhase {
        self.phase
    }

    pub fn state(&self) -> &OverlayState {
        &self.state
    }

    /// Records a move that happened outside of a gesture, e.g. the window
    /// manager pushing the overlay back on screen.
    pub fn place(&mut self, position: OverlayPosition) {
        self.state = OverlayState::at(position);
        self.phase = GesturePhase::Idle;
    }

    pub fn handle(&mut self, event: TouchEvent) -> OverlayAction {
        match event {
            TouchEvent::Start { raw_x, raw_y, at } => {
                self.state.dragging = false;
                self.state.gesture_started = Some(at);
                self.state.touch_origin = (raw_x, raw_y);
                self.state.window_origin = self.state.position;
                self.phase = GesturePhase::Tracking;
                OverlayAction::None
            }
            TouchEvent::Move { raw_x, raw_y } => {
                if self.phase != GesturePhase::Tracking {
                    return OverlayAction::None;
                }
                let dx = raw_x - self.state.touch_origin.0;
                let dy = raw_y - self.state.touch_origin.1;
                if dx.abs() > TAP_SLOP_PX || dy.abs() > TAP_SLOP_PX {
                    self.state.dragging = true;
                }
                self.state.position = OverlayPosition {
                    x: self.state.window_origin.x.saturating_add(dx as i32),
                    y: self.state.window_origin.y.saturating_add(dy as i32),
                };
                OverlayAction::MoveTo(self.state.position)
            }
            TouchEvent::End { at } => {
                if self.phase != GesturePhase::Tracking {
                    return OverlayAction::None;
                }
                self.phase = GesturePhase::Resolved;
                let quick = self
                    .state
                    .gesture_started
                    .is_some_and(|started| at.saturating_duration_since(started) < TAP_TIMEOUT);

                if self.state.dragging {
                    OverlayAction::DragFinished(self.state.position)
                } else if quick {
                    OverlayAction::Tap
                } else {
                    OverlayAction::None
                }
            }
        }
    }
}

impl Default for OverlayController {
    fn default() -> Self {
        Self::new(DEFAULT_OVERLAY_POSITION)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct OverlayFile {
    #[serde(default)]
    position: OverlayPosition,
}

/// Remembers where the user left the overlay.
#[derive(Debug, Clone)]
pub struct OverlayPositionStore {
    path: PathBuf,
}

impl OverlayPositionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<OverlayPosition> {
        if !self.path.exists() {
            return Ok(DEFAULT_OVERLAY_POSITION);
        }
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read overlay state {}", self.path.display()))?;
        let file: OverlayFile = toml::from_str(&text).with_context(|| {
            format!(
                "failed to parse overlay state {} (expected TOML)",
                self.path.display()
            )
        })?;
        Ok(file.position)
    }

    pub fn save(&self, position: OverlayPosition) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let text = toml::to_string(&OverlayFile { position })
            .context("failed to serialize overlay state")?;
        std::fs::write(&self.path, text)
            .with_context(|| format!("failed to write overlay state {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::{
        DEFAULT_OVERLAY_POSITION, GesturePhase, OverlayAction, OverlayController,
        OverlayPosition, OverlayPositionStore, TouchEvent,
    };
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn start(at: Instant, x: f64, y: f64) -> TouchEvent {
        TouchEvent::Start {
            raw_x: x,
            raw_y: y,
            at,
        }
    }

    fn moved(x: f64, y: f64) -> TouchEvent {
        TouchEvent::Move { raw_x: x, raw_y: y }
    }

    /// Replays a trace and returns how many taps fired.
    fn replay(controller: &mut OverlayController, events: &[TouchEvent]) -> usize {
        events
            .iter()
            .filter(|event| controller.handle(**event) == OverlayAction::Tap)
            .count()
    }

    #[test]
    fn quick_still_press_is_a_tap() {
        let t0 = Instant::now();
        let mut controller = OverlayController::default();
        let taps = replay(
            &mut controller,
            &[
                start(t0, 500.0, 500.0),
                moved(503.0, 498.0),
                moved(510.0, 490.0),
                TouchEvent::End {
                    at: t0 + Duration::from_millis(120),
                },
            ],
        );
        assert_eq!(taps, 1);
        assert_eq!(controller.phase(), GesturePhase::Resolved);
        assert_eq!(controller.position(), OverlayPosition { x: 110, y: 290 });
    }

    #[test]
    fn slow_press_fires_nothing() {
        let t0 = Instant::now();
        let mut controller = OverlayController::default();
        let taps = replay(
            &mut controller,
            &[
                start(t0, 50.0, 50.0),
                TouchEvent::End {
                    at: t0 + Duration::from_millis(300),
                },
            ],
        );
        assert_eq!(taps, 0);
        assert_eq!(controller.position(), DEFAULT_OVERLAY_POSITION);
    }

    #[test]
    fn drag_is_sticky_and_tracks_every_move() {
        let t0 = Instant::now();
        let mut controller = OverlayController::new(OverlayPosition { x: 10, y: 20 });
        controller.handle(start(t0, 200.0, 200.0));

        assert_eq!(
            controller.handle(moved(215.0, 200.0)),
            OverlayAction::MoveTo(OverlayPosition { x: 25, y: 20 })
        );
        assert!(controller.state().dragging);

        // Coming back near the contact point does not undo the drag.
        assert_eq!(
            controller.handle(moved(201.5, 197.2)),
            OverlayAction::MoveTo(OverlayPosition { x: 11, y: 18 })
        );
        assert_eq!(
            controller.handle(TouchEvent::End {
                at: t0 + Duration::from_millis(80),
            }),
            OverlayAction::DragFinished(OverlayPosition { x: 11, y: 18 })
        );
    }

    #[test]
    fn random_traces_resolve_consistently() {
        let t0 = Instant::now();
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = move |bound: u64| {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed % bound
        };

        for _ in 0..500 {
            let origin = OverlayPosition {
                x: next(800) as i32,
                y: next(800) as i32,
            };
            let mut controller = OverlayController::new(origin);
            let (cx, cy) = (next(1000) as f64, next(1000) as f64);
            let mut events = vec![start(t0, cx, cy)];
            let mut max_offset: f64 = 0.0;
            let mut last = (0.0, 0.0);
            for _ in 0..next(6) {
                let dx = next(31) as f64 - 15.0;
                let dy = next(31) as f64 - 15.0;
                max_offset = max_offset.max(dx.abs()).max(dy.abs());
                last = (dx, dy);
                events.push(moved(cx + dx, cy + dy));
            }
            let held = Duration::from_millis(next(600));
            events.push(TouchEvent::End { at: t0 + held });

            let taps = replay(&mut controller, &events);
            if max_offset <= 10.0 && held < Duration::from_millis(300) {
                assert_eq!(taps, 1, "{events:?}");
            } else {
                assert_eq!(taps, 0, "{events:?}");
            }
            assert_eq!(
                controller.position(),
                OverlayPosition {
                    x: origin.x + last.0 as i32,
                    y: origin.y + last.1 as i32,
                }
            );
        }
    }

    #[test]
    fn stray_events_outside_a_gesture_are_ignored() {
        let mut controller = OverlayController::default();
        assert_eq!(controller.handle(moved(900.0, 900.0)), OverlayAction::None);
        assert_eq!(
            controller.handle(TouchEvent::End { at: Instant::now() }),
            OverlayAction::None
        );
        assert_eq!(controller.position(), DEFAULT_OVERLAY_POSITION);
        assert_eq!(controller.phase(), GesturePhase::Idle);
    }

    #[test]
    fn new_contact_restarts_from_current_position() {
        let t0 = Instant::now();
        let mut controller = OverlayController::default();
        controller.handle(start(t0, 0.0, 0.0));
        controller.handle(moved(40.0, 0.0));
        controller.handle(TouchEvent::End { at: t0 });

        controller.handle(start(t0, 300.0, 300.0));
        assert!(!controller.state().dragging);
        controller.handle(moved(300.0, 330.0));
        assert_eq!(controller.position(), OverlayPosition { x: 140, y: 330 });
    }

    #[test]
    fn placing_the_window_moves_the_next_drag_origin() {
        let t0 = Instant::now();
        let mut controller = OverlayController::default();
        controller.handle(start(t0, 0.0, 0.0));
        controller.handle(TouchEvent::End { at: t0 });
        assert_eq!(controller.phase(), GesturePhase::Resolved);

        controller.place(OverlayPosition { x: 600, y: 40 });
        assert_eq!(controller.phase(), GesturePhase::Idle);
        assert_eq!(controller.position(), OverlayPosition { x: 600, y: 40 });

        controller.handle(start(t0, 10.0, 10.0));
        assert_eq!(
            controller.handle(moved(30.0, 25.0)),
            OverlayAction::MoveTo(OverlayPosition { x: 620, y: 55 })
        );
    }

    #[test]
    fn position_store_round_trips_and_defaults() {
        let dir = tempdir().expect("tempdir");
        let store = OverlayPositionStore::new(dir.path().join("state").join("overlay.toml"));
        assert_eq!(store.load().expect("load"), DEFAULT_OVERLAY_POSITION);

        store
            .save(OverlayPosition { x: -40, y: 812 })
            .expect("save");
        assert_eq!(
            store.load().expect("load"),
            OverlayPosition { x: -40, y: 812 }
        );
    }

    #[test]
    fn corrupt_position_file_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("overlay.toml");
        std::fs::write(&path, "position = 'left'").expect("write");
        assert!(OverlayPositionStore::new(path).load().is_err());
    }
}

//! Holds delivered captures until the user decides what goes to the model.
//!
//! In [`ReviewMode::Auto`] every capture is submitted as soon as it arrives. In
//! [`ReviewMode::Confirm`] the newest capture waits until it is confirmed,
//! cropped or discarded. Either way the last submitted capture stays around so
//! it can be analyzed again.

use crate::encode::{CropRegion, EncodedImage};
use crate::error::CaptureError;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewMode {
    #[default]
    Auto,
    Confirm,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewCommand {
    Confirm,
    Discard,
    Crop(CropRegion),
    Reanalyze,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewEvent {
    Pending {
        capture: u64,
        width: u32,
        height: u32,
    },
    Cropped {
        capture: u64,
        width: u32,
        height: u32,
    },
    Submitted {
        capture: u64,
        width: u32,
        height: u32,
    },
    Discarded {
        capture: u64,
    },
    Refused {
        error: CaptureError,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReviewSummary {
    pub submitted: u64,
    pub discarded: u64,
}

/// Result of one review step: what to tell the user and what, if anything, to
/// hand to the analysis worker.
#[derive(Debug)]
pub struct ReviewStep {
    pub event: ReviewEvent,
    pub submit: Option<EncodedImage>,
}

impl ReviewStep {
    fn refused(error: CaptureError) -> Self {
        Self {
            event: ReviewEvent::Refused { error },
            submit: None,
        }
    }
}

#[derive(Debug)]
pub struct ReviewDesk {
    mode: ReviewMode,
    jpeg_quality: u8,
    captures: u64,
    pending: Option<(u64, EncodedImage)>,
    last_submitted: Option<(u64, EncodedImage)>,
}

impl ReviewDesk {
    pub fn new(mode: ReviewMode, jpeg_quality: u8) -> Self {
        Self {
            mode,
            jpeg_quality,
            captures: 0,
            pending: None,
            last_submitted: None,
        }
    }

    pub fn mode(&self) -> ReviewMode {
        self.mode
    }

    pub fn pending(&self) -> Option<&EncodedImage> {
        self.pending.as_ref().map(|(_, image)| image)
    }

    /// A new capture replaces one still waiting for review.
    pub fn offer(&mut self, image: EncodedImage) -> ReviewStep {
        self.captures += 1;
        let capture = self.captures;
        match self.mode {
            ReviewMode::Auto => self.submit(capture, image),
            ReviewMode::Confirm => {
                if let Some((previous, _)) = self.pending.take() {
                    log::info!("capture {previous} superseded by capture {capture}");
                }
                let event = ReviewEvent::Pending {
                    capture,
                    width: image.width(),
                    height: image.height(),
                };
                self.pending = Some((capture, image));
                ReviewStep {
                    event,
                    submit: None,
                }
            }
        }
    }

    pub fn apply(&mut self, command: ReviewCommand) -> ReviewStep {
        match command {
            ReviewCommand::Confirm => match self.pending.take() {
                Some((capture, image)) => self.submit(capture, image),
                None => ReviewStep::refused(nothing_pending()),
            },
            ReviewCommand::Discard => match self.pending.take() {
                Some((capture, _)) => ReviewStep {
                    event: ReviewEvent::Discarded { capture },
                    submit: None,
                },
                None => ReviewStep::refused(nothing_pending()),
            },
            ReviewCommand::Crop(region) => {
                let Some((capture, image)) = self.pending.as_mut() else {
                    return ReviewStep::refused(nothing_pending());
                };
                match image.cropped(region, self.jpeg_quality) {
                    Ok(cropped) => {
                        *image = cropped;
                        ReviewStep {
                            event: ReviewEvent::Cropped {
                                capture: *capture,
                                width: image.width(),
                                height: image.height(),
                            },
                            submit: None,
                        }
                    }
                    Err(error) => ReviewStep::refused(error),
                }
            }
            ReviewCommand::Reanalyze => match self.last_submitted.clone() {
                Some((capture, image)) => self.submit(capture, image),
                None => ReviewStep::refused(CaptureError::unavailable(
                    "nothing has been analyzed yet",
                )),
            },
        }
    }

    fn submit(&mut self, capture: u64, image: EncodedImage) -> ReviewStep {
        let event = ReviewEvent::Submitted {
            capture,
            width: image.width(),
            height: image.height(),
        };
        self.last_submitted = Some((capture, image.clone()));
        ReviewStep {
            event,
            submit: Some(image),
        }
    }
}

fn nothing_pending() -> CaptureError {
    CaptureError::unavailable("no capture is waiting for review")
}

/// Sits between the coordinator and the analysis worker. Ends when the
/// coordinator's image channel closes, which drops `submit` and in turn lets
/// the analysis worker finish.
pub fn spawn_review_stage(
    mut images: UnboundedReceiver<EncodedImage>,
    mut commands: UnboundedReceiver<ReviewCommand>,
    mut desk: ReviewDesk,
    submit: UnboundedSender<EncodedImage>,
    event_tx: Option<UnboundedSender<ReviewEvent>>,
) -> JoinHandle<ReviewSummary> {
    tokio::spawn(async move {
        let mut summary = ReviewSummary::default();

        loop {
            let step = tokio::select! {
                image = images.recv() => match image {
                    Some(image) => desk.offer(image),
                    None => break,
                },
                Some(command) = commands.recv() => desk.apply(command),
            };

            match &step.event {
                ReviewEvent::Discarded { .. } => summary.discarded += 1,
                ReviewEvent::Refused { error } => log::debug!("review command refused: {error}"),
                _ => {}
            }
            if let Some(image) = step.submit {
                if submit.send(image).is_err() {
                    log::warn!("analysis worker is gone; capture dropped");
                    break;
                }
                summary.submitted += 1;
            }
            if let Some(tx) = &event_tx {
                let _ = tx.send(step.event);
            }
        }

        summary
    })
}

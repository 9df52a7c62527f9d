//! The long-lived background unit that owns the coordinator.
//!
//! Starting promotes the unit to the foreground through the host, then spawns
//! the coordinator on its own task. Everything after that is message passing
//! through [`ServiceHandle`].

use crate::authorization::CaptureCredential;
use crate::coordinator::{ServiceCommand, SessionCoordinator, SessionSummary};
use crate::error::CaptureError;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// First platform level that requires foreground services to declare a type.
pub const TYPED_FOREGROUND_MIN_API: u32 = 29;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    /// Hosts the floating control only.
    Overlay,
    /// Hosts the overlay and holds a capture grant.
    MediaProjection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForegroundRegistration {
    pub kind: ServiceKind,
    pub typed: bool,
}

impl ForegroundRegistration {
    /// Service type declared with the promotion, if the platform wants one.
    pub fn category(&self) -> Option<&'static str> {
        match (self.kind, self.typed) {
            (ServiceKind::MediaProjection, true) => Some("mediaProjection"),
            (ServiceKind::Overlay, true) => Some("specialUse"),
            (_, false) => None,
        }
    }
}

/// Platforms without API levels always get the typed registration.
pub fn registration_for(kind: ServiceKind, api_level: Option<u32>) -> ForegroundRegistration {
    ForegroundRegistration {
        kind,
        typed: api_level.is_none_or(|level| level >= TYPED_FOREGROUND_MIN_API),
    }
}

pub trait ForegroundHost: Send + Sync {
    fn api_level(&self) -> Option<u32>;
    fn promote(&self, registration: &ForegroundRegistration) -> Result<()>;
    fn demote(&self);
}

/// Desktop processes are always allowed to run in the foreground.
#[derive(Debug, Default, Clone, Copy)]
pub struct DesktopForegroundHost;

impl ForegroundHost for DesktopForegroundHost {
    fn api_level(&self) -> Option<u32> {
        None
    }

    fn promote(&self, registration: &ForegroundRegistration) -> Result<()> {
        log::debug!(
            "running capture service in the foreground ({:?}, {})",
            registration.kind,
            registration.category().unwrap_or("untyped")
        );
        Ok(())
    }

    fn demote(&self) {
        log::debug!("capture service left the foreground");
    }
}

pub struct CaptureService;

impl CaptureService {
    /// SHOW/START. A credential passed here is adopted before any command runs.
    pub fn start(
        host: Arc<dyn ForegroundHost>,
        coordinator: SessionCoordinator,
        credential: Option<CaptureCredential>,
    ) -> Result<ServiceHandle, CaptureError> {
        let kind = if credential.is_some() {
            ServiceKind::MediaProjection
        } else {
            ServiceKind::Overlay
        };
        let registration = registration_for(kind, host.api_level());
        host.promote(&registration)
            .map_err(|err| CaptureError::StartRestricted(format!("{err:#}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(credential) = credential {
            let _ = tx.send(ServiceCommand::Grant(credential));
        }

        let task_host = host.clone();
        let join = tokio::spawn(async move {
            let summary = coordinator.run(rx).await;
            task_host.demote();
            summary
        });

        log::info!("capture service started");
        Ok(ServiceHandle { tx, join })
    }
}

pub struct ServiceHandle {
    tx: mpsc::UnboundedSender<ServiceCommand>,
    join: JoinHandle<SessionSummary>,
}

impl ServiceHandle {
    pub fn tap(&self) -> Result<(), CaptureError> {
        self.capture(None)
    }

    pub fn capture(&self, defer: Option<Duration>) -> Result<(), CaptureError> {
        self.send(ServiceCommand::Capture { defer })
    }

    pub fn enable(&self) -> Result<(), CaptureError> {
        self.send(ServiceCommand::Enable)
    }

    pub fn grant(&self, credential: CaptureCredential) -> Result<(), CaptureError> {
        self.send(ServiceCommand::Grant(credential))
    }

    pub fn revoke(&self) -> Result<(), CaptureError> {
        self.send(ServiceCommand::RevokeGrant)
    }

    /// Sender for other producers such as the permission watcher.
    pub fn commands(&self) -> mpsc::UnboundedSender<ServiceCommand> {
        self.tx.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }

    /// HIDE/STOP. Resolves once the coordinator has released everything.
    pub async fn stop(self) -> Result<SessionSummary> {
        let _ = self.tx.send(ServiceCommand::Stop);
        self.join.await.context("capture service task failed")
    }

    fn send(&self, command: ServiceCommand) -> Result<(), CaptureError> {
        self.tx
            .send(command)
            .map_err(|_| CaptureError::unavailable("capture service is not running"))
    }
}

use crate::coordinator::ServiceCommand;
use crate::permissions::ScreenRecordingStatus;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};

const PERMISSION_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Revokes the held capture grant when the OS withdraws screen recording
/// access. Returns `None` on hosts without such a permission.
pub fn spawn_permission_watch<F>(
    command_tx: UnboundedSender<ServiceCommand>,
    notifier: F,
) -> Option<JoinHandle<()>>
where
    F: Fn(ScreenRecordingStatus) + Send + 'static,
{
    use crate::permissions::screen_recording_status;

    if matches!(
        screen_recording_status(),
        ScreenRecordingStatus::NotSupported
    ) {
        return None;
    }
    Some(watch_status(
        command_tx,
        notifier,
        screen_recording_status,
        PERMISSION_POLL_INTERVAL,
    ))
}

fn watch_status<F, S>(
    command_tx: UnboundedSender<ServiceCommand>,
    notifier: F,
    status: S,
    interval: Duration,
) -> JoinHandle<()>
where
    F: Fn(ScreenRecordingStatus) + Send + 'static,
    S: Fn() -> ScreenRecordingStatus + Send + 'static,
{
    let initial_status = status();
    tokio::spawn(async move {
        let mut last_status = initial_status;
        loop {
            if command_tx.is_closed() {
                break;
            }

            sleep(interval).await;

            if command_tx.is_closed() {
                break;
            }

            let current = status();
            if current == last_status {
                continue;
            }
            last_status = current;
            notifier(current);

            match current {
                ScreenRecordingStatus::Denied => {
                    log::warn!("screen recording permission withdrawn");
                    if command_tx.send(ServiceCommand::RevokeGrant).is_err() {
                        break;
                    }
                }
                ScreenRecordingStatus::Granted => {
                    log::info!("screen recording permission restored");
                }
                ScreenRecordingStatus::NotSupported => break,
            }
        }
    })
}

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::session::SessionCommand;

/// Normalized press-and-hold input. Whatever raw surface produces these
/// (pointer, touch, hotkey, stdin) is responsible for collapsing its own
/// overlapping events into this single stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GestureEvent {
    Press,
    Release,
    /// The operator slid off the control while holding; treated like a
    /// release.
    DragAway,
}

/// Grace period between a release-class gesture and the actual stop, so
/// trailing speech is not cut off. A UX policy of this controller, not of
/// the session.
pub const STOP_DELAY: Duration = Duration::from_millis(300);

/// Translate gestures into session commands.
///
/// Press starts immediately and cancels any pending delayed stop, so a
/// quick re-press continues the hold instead of being killed by the stale
/// release. Overlapping release-class events collapse into one pending
/// stop; the session never sees duplicates.
pub fn spawn_gesture_controller(
    mut gesture_rx: mpsc::Receiver<GestureEvent>,
    cmd_tx: mpsc::Sender<SessionCommand>,
    stop_delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut pending_stop: Option<Instant> = None;
        loop {
            tokio::select! {
                event = gesture_rx.recv() => match event {
                    Some(GestureEvent::Press) => {
                        if pending_stop.take().is_some() {
                            tracing::debug!("press during stop delay; hold continues");
                        }
                        if cmd_tx.send(SessionCommand::Start).await.is_err() {
                            break;
                        }
                    }
                    Some(GestureEvent::Release) | Some(GestureEvent::DragAway) => {
                        if pending_stop.is_none() {
                            pending_stop = Some(Instant::now() + stop_delay);
                        }
                    }
                    None => break,
                },
                _ = sleep_until_or_pending(pending_stop) => {
                    pending_stop = None;
                    if cmd_tx.send(SessionCommand::Stop).await.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("gesture controller exiting");
    })
}

async fn sleep_until_or_pending(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

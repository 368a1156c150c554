//! Cooperative event loop around a [`ModeController`].
//!
//! One task owns the controller and multiplexes three sources: the alert-cycle
//! deadline, session events and user commands. Each wake-up is handled to
//! completion before the next is accepted, so transitions never interleave.
//! Callers talk to the task through a cloneable [`ControllerHandle`].

use std::future;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info};

use crate::battery::BatteryReport;
use crate::controller::ModeController;
use crate::error::{NearGuardError, Result};
use crate::session::SessionEvent;
use crate::types::{AlertLevel, StatusSnapshot};

/// Commands queued before the loop applies back-pressure.
const COMMAND_BUFFER: usize = 32;

type Reply<T> = oneshot::Sender<Result<T>>;

/// A user-initiated request for the controller task.
#[derive(Debug)]
enum Command {
    RequestRadar(Reply<()>),
    RequestAlertMode(Reply<()>),
    SendAlert(AlertLevel, Reply<()>),
    ReadBattery(Reply<BatteryReport>),
    Disconnect(Reply<()>),
}

/// Cloneable front end of a running controller task.
///
/// The task stops, disconnecting first, once every handle is dropped.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<StatusSnapshot>,
}

impl ControllerHandle {
    /// See [`ModeController::request_radar`].
    ///
    /// # Errors
    ///
    /// The controller's error, or `ControllerStopped` if the task is gone.
    pub async fn request_radar(&self) -> Result<()> {
        self.call(Command::RequestRadar).await
    }

    /// See [`ModeController::request_alert_mode`].
    ///
    /// # Errors
    ///
    /// The controller's error, or `ControllerStopped` if the task is gone.
    pub async fn request_alert_mode(&self) -> Result<()> {
        self.call(Command::RequestAlertMode).await
    }

    /// See [`ModeController::send_alert`].
    ///
    /// # Errors
    ///
    /// The controller's error, or `ControllerStopped` if the task is gone.
    pub async fn send_alert(&self, level: AlertLevel) -> Result<()> {
        self.call(|reply| Command::SendAlert(level, reply)).await
    }

    /// See [`ModeController::read_battery`].
    ///
    /// # Errors
    ///
    /// The controller's error, or `ControllerStopped` if the task is gone.
    pub async fn read_battery(&self) -> Result<BatteryReport> {
        self.call(Command::ReadBattery).await
    }

    /// See [`ModeController::disconnect`].
    ///
    /// # Errors
    ///
    /// `ControllerStopped` if the task is gone.
    pub async fn disconnect(&self) -> Result<()> {
        self.call(Command::Disconnect).await
    }

    /// Latest published snapshot.
    #[must_use]
    pub fn status(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    /// A fresh receiver of published snapshots.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.clone()
    }

    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| NearGuardError::ControllerStopped)?;
        response
            .await
            .map_err(|_| NearGuardError::ControllerStopped)?
    }
}

/// Move `controller` onto its own task.
#[must_use]
pub fn spawn(controller: ModeController) -> (ControllerHandle, JoinHandle<()>) {
    let (commands, inbox) = mpsc::channel(COMMAND_BUFFER);
    let handle = ControllerHandle {
        commands,
        status: controller.subscribe(),
    };
    let task = tokio::spawn(run(controller, inbox));
    (handle, task)
}

enum Wake {
    Tick,
    Session(SessionEvent),
    Command(Option<Command>),
}

async fn run(mut controller: ModeController, mut inbox: mpsc::Receiver<Command>) {
    info!("Controller task started");
    loop {
        let deadline = controller.next_alert_deadline();

        let wake = tokio::select! {
            biased;
            () = tick_at(deadline) => Wake::Tick,
            event = controller.next_session_event() => Wake::Session(event),
            command = inbox.recv() => Wake::Command(command),
        };

        match wake {
            Wake::Tick => controller.on_timer(Instant::now()),
            Wake::Session(event) => {
                controller.handle_session_event(event, Instant::now()).await;
            }
            Wake::Command(Some(command)) => dispatch(&mut controller, command).await,
            Wake::Command(None) => break,
        }
    }

    controller.shutdown().await;
    info!("Controller task stopped");
}

async fn dispatch(controller: &mut ModeController, command: Command) {
    debug!(?command, "Command received");
    // A dropped reply receiver only means the caller stopped waiting.
    match command {
        Command::RequestRadar(reply) => {
            let _ = reply.send(controller.request_radar().await);
        }
        Command::RequestAlertMode(reply) => {
            let _ = reply.send(controller.request_alert_mode().await);
        }
        Command::SendAlert(level, reply) => {
            let _ = reply.send(controller.send_alert(level).await);
        }
        Command::ReadBattery(reply) => {
            let _ = reply.send(controller.read_battery().await);
        }
        Command::Disconnect(reply) => {
            controller.disconnect().await;
            let _ = reply.send(Ok(()));
        }
    }
}

async fn tick_at(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::config::Config;
    use crate::mock::{MockTransport, RecordingNotifier};
    use crate::types::OperatingMode;

    fn start(mock: &MockTransport) -> (ControllerHandle, JoinHandle<()>, RecordingNotifier) {
        let notifier = RecordingNotifier::default();
        let controller = ModeController::from_config(
            &Config::default(),
            Arc::new(mock.clone()),
            Box::new(notifier.clone()),
        );
        let (handle, task) = spawn(controller);
        (handle, task, notifier)
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_controller_futures_are_send() {
        let mock = MockTransport::new();
        let mut controller = ModeController::from_config(
            &Config::default(),
            Arc::new(mock.clone()),
            Box::new(RecordingNotifier::default()),
        );
        assert_send(&controller.read_battery());
        assert_send(&controller.send_alert(AlertLevel::Mild));
        assert_send(&controller.request_alert_mode());
        assert_send(&controller.process_next_event());

        let (_commands, inbox) = mpsc::channel(1);
        assert_send(&run(controller, inbox));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_round_trip_through_handle() {
        let mock = MockTransport::new();
        let (handle, task, _) = start(&mock);
        let mut status = handle.subscribe();

        handle.request_radar().await.unwrap();
        assert_eq!(handle.status().mode, OperatingMode::Radar);

        assert!(mock.push_sample(-58));
        status
            .wait_for(|s| s.device.as_ref().and_then(|d| d.last_rssi) == Some(-58))
            .await
            .unwrap();

        handle.request_alert_mode().await.unwrap();
        handle.send_alert(AlertLevel::Strong).await.unwrap();
        assert_eq!(mock.written_bytes(), vec![vec![0x02]]);

        handle.disconnect().await.unwrap();
        status
            .wait_for(|s| s.mode == OperatingMode::Idle)
            .await
            .unwrap();

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_drives_alert_cycle_timer() {
        let mock = MockTransport::new();
        let (handle, _task, notifier) = start(&mock);
        handle.request_radar().await.unwrap();

        assert!(mock.push_sample(-105));
        time::sleep(Duration::from_secs(10)).await;

        assert_eq!(notifier.fires().len(), 5);
        assert!(!handle.status().alert_cycle_active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_loss_resets_to_idle() {
        let mock = MockTransport::new();
        let (handle, _task, _) = start(&mock);
        handle.request_radar().await.unwrap();
        handle.request_alert_mode().await.unwrap();

        mock.drop_remote();
        let mut status = handle.subscribe();
        let snapshot = status
            .wait_for(|s| s.mode == OperatingMode::Idle)
            .await
            .unwrap()
            .clone();
        assert!(snapshot.is_error);
        assert!(snapshot.device.is_none());
    }

    #[tokio::test]
    async fn test_dropping_last_handle_stops_task() {
        let mock = MockTransport::new();
        let (handle, task, _) = start(&mock);
        handle.request_radar().await.unwrap();

        drop(handle);
        task.await.unwrap();
        assert_eq!(mock.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_stopped_task_reports_controller_stopped() {
        let mock = MockTransport::new();
        let (handle, task, _) = start(&mock);
        task.abort();
        let _ = task.await;

        assert!(matches!(
            handle.request_radar().await,
            Err(NearGuardError::ControllerStopped)
        ));
    }
}

// Session heartbeat: max-duration watchdog, CPU sampling and auto-stop dispatch
//
// Runs on its own thread for the lifetime of a session. Other parts of the engine
// never stop the session directly from a background thread; they send a
// `RequestStop` here and the supervisor hands it to a short-lived stop thread
// (stopping joins the supervisor, so it cannot run on the supervisor itself).

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{select, tick, Receiver, Sender};

use super::clock::Clock;
use super::frame::Timestamp;
use super::state::StopReason;
use super::stats::StatisticsCollector;

/// Control messages accepted by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorMessage {
    /// Stop the session on behalf of a background component
    RequestStop(StopReason),
    /// The session is being torn down; exit the loop
    Shutdown,
}

/// Callback that performs the actual stop
pub type StopHandler = Arc<dyn Fn(StopReason) + Send + Sync>;

pub struct SupervisorSettings {
    pub started_at: Timestamp,
    pub max_duration: Duration,
    pub heartbeat: Duration,
}

pub struct Supervisor {
    control: Sender<SupervisorMessage>,
    thread: Option<JoinHandle<()>>,
}

impl Supervisor {
    pub fn spawn(
        settings: SupervisorSettings,
        control: Sender<SupervisorMessage>,
        control_rx: Receiver<SupervisorMessage>,
        clock: Arc<dyn Clock>,
        stats: Arc<StatisticsCollector>,
        on_stop: StopHandler,
    ) -> std::io::Result<Self> {
        let thread = std::thread::Builder::new()
            .name("rewind-supervisor".into())
            .spawn(move || run(settings, control_rx, clock, stats, on_stop))?;

        Ok(Self {
            control,
            thread: Some(thread),
        })
    }

    pub fn shutdown(mut self) {
        let _ = self.control.send(SupervisorMessage::Shutdown);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::error!("[Supervisor] Supervisor thread panicked");
            }
        }
    }
}

fn run(
    settings: SupervisorSettings,
    control_rx: Receiver<SupervisorMessage>,
    clock: Arc<dyn Clock>,
    stats: Arc<StatisticsCollector>,
    on_stop: StopHandler,
) {
    let ticker = tick(settings.heartbeat.max(Duration::from_millis(1)));
    let mut stop_dispatched = false;

    log::debug!(
        "[Supervisor] Watching session, max duration {:?}, heartbeat {:?}",
        settings.max_duration,
        settings.heartbeat
    );

    loop {
        select! {
            recv(control_rx) -> msg => match msg {
                Ok(SupervisorMessage::RequestStop(reason)) => {
                    if !stop_dispatched {
                        stop_dispatched = true;
                        dispatch_stop(&on_stop, reason);
                    }
                }
                Ok(SupervisorMessage::Shutdown) | Err(_) => break,
            },
            recv(ticker) -> _ => {
                stats.sample_system();

                let elapsed = clock.now().duration_since(settings.started_at);
                if !stop_dispatched && elapsed >= settings.max_duration {
                    log::info!(
                        "[Supervisor] Session reached max duration ({:?}), stopping",
                        settings.max_duration
                    );
                    stop_dispatched = true;
                    dispatch_stop(&on_stop, StopReason::MaxDurationReached);
                }
            }
        }
    }

    log::debug!("[Supervisor] Exiting");
}

fn dispatch_stop(on_stop: &StopHandler, reason: StopReason) {
    let on_stop = on_stop.clone();
    let spawned = std::thread::Builder::new()
        .name("rewind-auto-stop".into())
        .spawn(move || on_stop(reason));
    if let Err(e) = spawned {
        log::error!("[Supervisor] Failed to spawn stop thread: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::clock::ManualClock;
    use crossbeam_channel::unbounded;

    fn spawn_with(
        clock: Arc<ManualClock>,
        max_duration: Duration,
    ) -> (Supervisor, Sender<SupervisorMessage>, Receiver<StopReason>) {
        let (stopped_tx, stopped_rx) = unbounded();
        let (control, control_rx) = unbounded();
        let on_stop: StopHandler = Arc::new(move |reason| {
            let _ = stopped_tx.send(reason);
        });
        let supervisor = Supervisor::spawn(
            SupervisorSettings {
                started_at: clock.now(),
                max_duration,
                heartbeat: Duration::from_millis(10),
            },
            control.clone(),
            control_rx,
            clock,
            Arc::new(StatisticsCollector::new()),
            on_stop,
        )
        .unwrap();
        (supervisor, control, stopped_rx)
    }

    #[test]
    fn test_max_duration_triggers_single_stop() {
        let clock = Arc::new(ManualClock::default());
        let (supervisor, _control, stopped) = spawn_with(clock.clone(), Duration::from_secs(60));

        assert!(stopped.recv_timeout(Duration::from_millis(100)).is_err());
        clock.advance(Duration::from_secs(60));
        assert_eq!(
            stopped.recv_timeout(Duration::from_secs(2)),
            Ok(StopReason::MaxDurationReached)
        );
        // Later heartbeats do not dispatch again
        assert!(stopped.recv_timeout(Duration::from_millis(100)).is_err());
        supervisor.shutdown();
    }

    #[test]
    fn test_request_stop_is_forwarded() {
        let clock = Arc::new(ManualClock::default());
        let (supervisor, control, stopped) = spawn_with(clock, Duration::from_secs(3600));
        control
            .send(SupervisorMessage::RequestStop(StopReason::PersistenceFailure))
            .unwrap();
        assert_eq!(
            stopped.recv_timeout(Duration::from_secs(2)),
            Ok(StopReason::PersistenceFailure)
        );
        supervisor.shutdown();
    }
}

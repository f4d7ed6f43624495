//! Run lifecycle.
//!
//! [`RunLifecycle`] watches the data-acquisition state signal and run events
//! and drives the aggregator across run boundaries:
//!
//! | transition            | action                                   |
//! |-----------------------|------------------------------------------|
//! | any → `Ready`         | reset every statistics window            |
//! | any → `Running`       | start the run clock (if not already)     |
//! | `Running` → other     | end the run, keep duration and snapshot  |
//! | `RunStarted` event    | start the run clock (if not already)     |
//! | `RunEnded` event      | end the run (if running)                 |
//!
//! Each action is announced to subscribed handlers as a
//! [`LifecycleNotice`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::aggregator::{TelemetrySnapshot, WindowedAggregator};

/// Component name that sends the text run markers.
pub const LEGACY_RUN_ORIGIN: &str = "LArPix board";

/// Data-acquisition state as reported by the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaqState {
    /// Nothing configured.
    #[default]
    NotRunning,
    /// Armed for a new run.
    Ready,
    /// Taking data.
    Running,
    /// Data taking finished.
    Stopped,
}

/// Structured run boundary events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEvent {
    /// The board began a run.
    RunStarted,
    /// The board ended a run.
    RunEnded,
}

impl RunEvent {
    /// Maps the board's text run markers to events.
    ///
    /// Only exact `"Beginning run"` / `"Ending run"` texts from
    /// [`LEGACY_RUN_ORIGIN`] are recognized.
    pub fn from_legacy(origin: &str, text: &str) -> Option<Self> {
        if origin != LEGACY_RUN_ORIGIN {
            return None;
        }
        match text {
            "Beginning run" => Some(RunEvent::RunStarted),
            "Ending run" => Some(RunEvent::RunEnded),
            _ => None,
        }
    }
}

impl fmt::Display for RunEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunEvent::RunStarted => f.write_str("run started"),
            RunEvent::RunEnded => f.write_str("run ended"),
        }
    }
}

/// What a finished run looked like.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    /// Run number at the time the run ended.
    pub run_number: u64,
    /// Seconds between run start and end.
    pub duration_secs: f64,
    /// Telemetry as it stood when the run ended.
    pub final_snapshot: TelemetrySnapshot,
}

/// An action the lifecycle took.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleNotice {
    /// Statistics were cleared for a new run.
    Reset {
        /// The new run number.
        run_number: u64,
    },
    /// Data taking began.
    RunStarted {
        /// The current run number.
        run_number: u64,
    },
    /// Data taking ended.
    RunEnded(RunSummary),
}

type NoticeHandler = Box<dyn FnMut(&LifecycleNotice) + Send>;

/// Observes state changes and run events, resetting the aggregator at run
/// boundaries.
pub struct RunLifecycle {
    state: DaqState,
    last_run: Option<RunSummary>,
    handlers: Vec<NoticeHandler>,
}

impl fmt::Debug for RunLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLifecycle")
            .field("state", &self.state)
            .field("last_run", &self.last_run)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl Default for RunLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl RunLifecycle {
    /// Creates a lifecycle in the `NotRunning` state.
    pub fn new() -> Self {
        Self {
            state: DaqState::NotRunning,
            last_run: None,
            handlers: Vec::new(),
        }
    }

    /// Registers a handler called for every notice, in subscription order.
    pub fn subscribe<F>(&mut self, handler: F)
    where
        F: FnMut(&LifecycleNotice) + Send + 'static,
    {
        self.handlers.push(Box::new(handler));
    }

    /// Applies a state signal. Repeating the current state does nothing.
    pub fn observe_state(&mut self, new_state: DaqState, agg: &mut WindowedAggregator, now: f64) {
        let old_state = self.state;
        if new_state == old_state {
            return;
        }

        tracing::info!(from = ?old_state, to = ?new_state, "DAQ state changed");
        self.state = new_state;

        if old_state == DaqState::Running {
            self.finish_run(agg, now);
        }

        match new_state {
            DaqState::Ready => {
                agg.reset(now);
                let run_number = agg.run_state().run_number;
                self.notify(&LifecycleNotice::Reset { run_number });
            }
            DaqState::Running => self.start_run(agg, now),
            DaqState::NotRunning | DaqState::Stopped => {}
        }
    }

    /// Applies a run event. Recording the message that carried it is left
    /// to the caller.
    pub fn observe_event(&mut self, event: RunEvent, agg: &mut WindowedAggregator, now: f64) {
        match event {
            RunEvent::RunStarted => self.start_run(agg, now),
            RunEvent::RunEnded => self.finish_run(agg, now),
        }
    }

    /// The last observed state.
    pub fn state(&self) -> DaqState {
        self.state
    }

    /// Summary of the most recently finished run.
    pub fn last_run(&self) -> Option<&RunSummary> {
        self.last_run.as_ref()
    }

    fn start_run(&mut self, agg: &mut WindowedAggregator, now: f64) {
        if agg.run_state().is_running {
            return;
        }
        agg.begin_run(now);

        let run_number = agg.run_state().run_number;
        tracing::info!(run_number, "run started");
        self.notify(&LifecycleNotice::RunStarted { run_number });
    }

    fn finish_run(&mut self, agg: &mut WindowedAggregator, now: f64) {
        if !agg.run_state().is_running {
            return;
        }

        let final_snapshot = agg.snapshot(now);
        let duration_secs = agg.end_run(now);
        let summary = RunSummary {
            run_number: agg.run_state().run_number,
            duration_secs,
            final_snapshot,
        };

        tracing::info!(
            run_number = summary.run_number,
            duration_secs,
            "run ended"
        );
        self.notify(&LifecycleNotice::RunEnded(summary.clone()));
        self.last_run = Some(summary);
    }

    fn notify(&mut self, notice: &LifecycleNotice) {
        for handler in &mut self.handlers {
            handler(notice);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::config::MonitorConfig;
    use crate::record::{Record, TimestampRecord};

    fn aggregator() -> WindowedAggregator {
        WindowedAggregator::new(MonitorConfig::default(), 0.0).unwrap()
    }

    fn recorder(lifecycle: &mut RunLifecycle) -> Arc<Mutex<Vec<LifecycleNotice>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        lifecycle.subscribe(move |notice| sink.lock().unwrap().push(notice.clone()));
        seen
    }

    #[test]
    fn test_legacy_markers() {
        assert_eq!(
            RunEvent::from_legacy("LArPix board", "Beginning run"),
            Some(RunEvent::RunStarted)
        );
        assert_eq!(
            RunEvent::from_legacy("LArPix board", "Ending run"),
            Some(RunEvent::RunEnded)
        );
        assert_eq!(RunEvent::from_legacy("operator", "Beginning run"), None);
        assert_eq!(RunEvent::from_legacy("LArPix board", "beginning run"), None);
    }

    #[test]
    fn test_ready_resets_statistics() {
        let mut agg = aggregator();
        let mut lifecycle = RunLifecycle::new();
        let seen = recorder(&mut lifecycle);

        agg.ingest(Record::Timestamp(TimestampRecord { clock_value: 1 }), 5);
        lifecycle.observe_state(DaqState::Ready, &mut agg, 10.0);

        assert_eq!(agg.record_count(), 0);
        assert_eq!(agg.run_state().run_number, 1);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![LifecycleNotice::Reset { run_number: 1 }]
        );

        // repeated state is not a transition
        lifecycle.observe_state(DaqState::Ready, &mut agg, 11.0);
        assert_eq!(agg.run_state().run_number, 1);
    }

    #[test]
    fn test_running_to_stopped_keeps_summary() {
        let mut agg = aggregator();
        let mut lifecycle = RunLifecycle::new();

        lifecycle.observe_state(DaqState::Ready, &mut agg, 10.0);
        lifecycle.observe_state(DaqState::Running, &mut agg, 12.0);
        assert!(agg.run_state().is_running);

        agg.ingest(Record::Timestamp(TimestampRecord { clock_value: 1 }), 13);
        lifecycle.observe_state(DaqState::Stopped, &mut agg, 20.0);

        assert!(!agg.run_state().is_running);
        let summary = lifecycle.last_run().unwrap();
        assert_eq!(summary.run_number, 1);
        assert_eq!(summary.duration_secs, 8.0);
        assert_eq!(summary.final_snapshot.packets.len(), 1);
        // statistics are kept until the next Ready
        assert_eq!(agg.record_count(), 1);
    }

    #[test]
    fn test_run_events_drive_bookkeeping() {
        let mut agg = aggregator();
        let mut lifecycle = RunLifecycle::new();
        let seen = recorder(&mut lifecycle);

        lifecycle.observe_event(RunEvent::RunStarted, &mut agg, 3.0);
        // a second start while running is ignored
        lifecycle.observe_event(RunEvent::RunStarted, &mut agg, 4.0);
        lifecycle.observe_event(RunEvent::RunEnded, &mut agg, 7.0);
        // end without a run is ignored
        lifecycle.observe_event(RunEvent::RunEnded, &mut agg, 8.0);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], LifecycleNotice::RunStarted { run_number: 0 });
        match &seen[1] {
            LifecycleNotice::RunEnded(summary) => assert_eq!(summary.duration_secs, 4.0),
            other => panic!("unexpected notice: {other:?}"),
        }
        assert!(!agg.run_state().is_running);
    }

    #[test]
    fn test_state_and_event_do_not_double_start() {
        let mut agg = aggregator();
        let mut lifecycle = RunLifecycle::new();
        let seen = recorder(&mut lifecycle);

        lifecycle.observe_state(DaqState::Running, &mut agg, 1.0);
        lifecycle.observe_event(RunEvent::RunStarted, &mut agg, 2.0);
        assert_eq!(agg.run_state().start_time, 1.0);

        lifecycle.observe_event(RunEvent::RunEnded, &mut agg, 5.0);
        lifecycle.observe_state(DaqState::Stopped, &mut agg, 6.0);
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(lifecycle.state(), DaqState::Stopped);
    }
}

//! Forwarding of signals received by the launcher to the tasks of a step.
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use gantry::agent::{
    Agent, AgentMessage, AgentPayload, AgentTransport, Destination, DestinationState,
    DispatchReport,
};
use gantry::{Set, StepKey};
use nix::sys::signal::Signal;
use signal_hook::consts::{SIGCONT, SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook::iterator::{Handle, Signals};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

use crate::common::error::LaunchError;
use crate::launch::session::JobPhase;

/// Signals caught by the launcher and passed on to the step.
pub const FORWARDED_SIGNALS: [i32; 7] = [
    SIGINT, SIGTERM, SIGHUP, SIGQUIT, SIGUSR1, SIGUSR2, SIGCONT,
];

/// A second SIGINT within this window stops waiting for the step.
pub const FORCE_CANCEL_WINDOW: Duration = Duration::from_secs(1);

pub fn signal_name(signal: i32) -> String {
    Signal::try_from(signal)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| signal.to_string())
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SignalAction {
    /// Deliver the signal to every task of the step.
    Forward(i32),
    /// Give up on the step without waiting for its tasks.
    Overdone,
    Ignore,
}

/// Decides what a caught signal means for a running step.
#[derive(Debug)]
pub struct SignalPolicy {
    window: Duration,
    last_interrupt: Option<Instant>,
}

impl Default for SignalPolicy {
    fn default() -> Self {
        Self::new(FORCE_CANCEL_WINDOW)
    }
}

impl SignalPolicy {
    pub fn new(window: Duration) -> Self {
        SignalPolicy {
            window,
            last_interrupt: None,
        }
    }

    pub fn decide(&mut self, signal: i32, phase: JobPhase, now: Instant) -> SignalAction {
        if phase != JobPhase::Running {
            return SignalAction::Ignore;
        }
        if signal != SIGINT {
            return SignalAction::Forward(signal);
        }
        match self.last_interrupt {
            Some(previous) if now.saturating_duration_since(previous) < self.window => {
                self.last_interrupt = None;
                SignalAction::Overdone
            }
            _ => {
                self.last_interrupt = Some(now);
                SignalAction::Forward(signal)
            }
        }
    }
}

/// Waits for signals on a dedicated thread and hands them over to the runtime.
///
/// The thread is stopped and joined when the broker is dropped.
pub struct SignalBroker {
    signal_thread: Option<std::thread::JoinHandle<()>>,
    signal_handle: Handle,
}

impl SignalBroker {
    pub fn start(signals: &[i32], sender: UnboundedSender<i32>) -> crate::Result<Self> {
        let mut signals = Signals::new(signals).map_err(|error| {
            LaunchError::SignalError(format!("Cannot create signal set: {error}"))
        })?;
        let signal_handle = signals.handle();
        let signal_thread = std::thread::Builder::new()
            .name("signal-broker".to_string())
            .spawn(move || {
                for signal in &mut signals {
                    log::debug!("Received signal {}", signal_name(signal));
                    if sender.send(signal).is_err() {
                        break;
                    }
                }
            })?;
        Ok(Self {
            signal_thread: Some(signal_thread),
            signal_handle,
        })
    }
}

impl Drop for SignalBroker {
    fn drop(&mut self) {
        self.signal_handle.close();
        if let Some(thread) = self.signal_thread.take() {
            if thread.join().is_err() {
                log::error!("Signal thread crashed");
            }
        }
    }
}

/// Nodes that acknowledged the launch of the step.
///
/// Signals are only sent to these nodes.
#[derive(Debug, Default)]
pub struct LaunchTracker {
    replied: Mutex<Set<String>>,
}

impl LaunchTracker {
    pub fn mark_replied(&self, node: &str) {
        self.replied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node.to_string());
    }

    /// Marks every node that completed the launch dispatch.
    pub fn record_launch(&self, report: &DispatchReport) {
        let mut replied = self.replied.lock().unwrap_or_else(PoisonError::into_inner);
        for status in report.statuses() {
            if status.state == DestinationState::Done {
                replied.insert(status.destination.name.clone());
            }
        }
    }

    pub fn has_replied(&self, node: &str) -> bool {
        self.replied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(node)
    }

    pub fn replied_destinations(&self, destinations: &[Destination]) -> Vec<Destination> {
        let replied = self.replied.lock().unwrap_or_else(PoisonError::into_inner);
        destinations
            .iter()
            .filter(|d| replied.contains(&d.name))
            .cloned()
            .collect()
    }
}

/// Sends `signal` to the tasks of the step on every node that acknowledged
/// the launch. Returns `None` when no node has replied yet.
pub async fn forward_signal<T: AgentTransport>(
    agent: &Agent<T>,
    key: StepKey,
    signal: i32,
    destinations: &[Destination],
    tracker: &LaunchTracker,
) -> Option<DispatchReport> {
    let targets = tracker.replied_destinations(destinations);
    let skipped = destinations.len() - targets.len();
    if skipped > 0 {
        log::debug!(
            "Not sending {} to {skipped} node(s) that did not reply to the launch",
            signal_name(signal)
        );
    }
    if targets.is_empty() {
        return None;
    }
    let message = AgentMessage::new(key, AgentPayload::KillTasks { signal });
    let report = agent.dispatch(&message, &targets).await;
    if report.exit_code() != 0 {
        log::warn!(
            "{} could not be delivered to {} node(s) of step {key}",
            signal_name(signal),
            report.exit_code()
        );
        report.log_failures();
    }
    Some(report)
}

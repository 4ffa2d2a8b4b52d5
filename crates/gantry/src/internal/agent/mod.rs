//! Bounded fan-out of control messages to node daemons.
mod transport;

pub use transport::{AgentTransport, NodeAgent, TcpAgentTransport, serve_node_agent};

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::Instant;

use crate::internal::common::hostlist::compress_hostlist;
use crate::internal::common::sync::lock;
use crate::internal::messages::agent::{AgentMessage, AgentReply};
use crate::internal::server::config::AgentConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Node name, used in reports and drain actions.
    pub name: String,
    pub address: String,
}

impl Destination {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Destination {
            name: name.into(),
            address: address.into(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DestinationState {
    New,
    Active,
    Done,
    Failed,
}

impl DestinationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DestinationState::Done | DestinationState::Failed)
    }
}

impl fmt::Display for DestinationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DestinationState::New => "new",
            DestinationState::Active => "active",
            DestinationState::Done => "done",
            DestinationState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct DestinationStatus {
    pub destination: Destination,
    pub state: DestinationState,
    pub error: Option<String>,
    /// Time between becoming active and reaching a terminal state.
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct DispatchReport {
    kind: &'static str,
    statuses: Vec<DestinationStatus>,
    elapsed: Duration,
}

impl DispatchReport {
    /// Per-destination results, in the order the destinations were given.
    pub fn statuses(&self) -> &[DestinationStatus] {
        &self.statuses
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn failed(&self) -> impl Iterator<Item = &DestinationStatus> {
        self.statuses
            .iter()
            .filter(|s| s.state == DestinationState::Failed)
    }

    pub fn failed_names(&self) -> Vec<String> {
        self.failed().map(|s| s.destination.name.clone()).collect()
    }

    pub fn done_count(&self) -> usize {
        self.statuses
            .iter()
            .filter(|s| s.state == DestinationState::Done)
            .count()
    }

    /// 0 when every destination succeeded, otherwise the number of failures.
    pub fn exit_code(&self) -> i32 {
        self.failed().count() as i32
    }

    /// Logs the failed destinations; used for fire-and-forget dispatches.
    pub fn log_failures(&self) {
        let failed = self.failed_names();
        if failed.is_empty() {
            return;
        }
        log::warn!(
            "{} failed on {} node(s): {}",
            self.kind,
            failed.len(),
            compress_hostlist(&failed)
        );
        for status in self.failed() {
            log::debug!(
                "{} to {} ({}): {}",
                self.kind,
                status.destination.name,
                status.destination.address,
                status.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
}

/// Sends one message to many nodes with at most `fanout_width` in flight.
pub struct Agent<T> {
    transport: T,
    fanout_width: usize,
    command_timeout: Duration,
}

impl<T: AgentTransport> Agent<T> {
    pub fn new(transport: T, config: &AgentConfig) -> Self {
        Agent {
            transport,
            fanout_width: config.fanout_width.max(1),
            command_timeout: config.command_timeout,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn fanout_width(&self) -> usize {
        self.fanout_width
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Delivers `message` to every destination.
    ///
    /// Returns once every destination is done or failed. A destination that
    /// does not reply within the command timeout is failed and its
    /// connection dropped.
    pub async fn dispatch(
        &self,
        message: &AgentMessage,
        destinations: &[Destination],
    ) -> DispatchReport {
        let start = Instant::now();
        let statuses = Mutex::new(
            destinations
                .iter()
                .map(|destination| DestinationStatus {
                    destination: destination.clone(),
                    state: DestinationState::New,
                    error: None,
                    elapsed: Duration::ZERO,
                })
                .collect::<Vec<_>>(),
        );
        log::debug!(
            "Dispatching {} for step {} to {} node(s)",
            message.kind(),
            message.step_key(),
            destinations.len()
        );

        futures::stream::iter(destinations.iter().enumerate())
            .map(|(index, destination)| {
                let statuses = &statuses;
                async move {
                    lock(statuses)[index].state = DestinationState::Active;
                    let activated = Instant::now();
                    let result = match tokio::time::timeout(
                        self.command_timeout,
                        self.transport.send(&destination.address, message),
                    )
                    .await
                    {
                        Ok(Ok(AgentReply::Ok)) => Ok(()),
                        Ok(Ok(AgentReply::Error(error))) => Err(error),
                        Ok(Err(error)) => Err(error.to_string()),
                        Err(_) => Err(format!(
                            "no reply within {}",
                            humantime::format_duration(self.command_timeout)
                        )),
                    };
                    let mut statuses = lock(statuses);
                    let status = &mut statuses[index];
                    status.elapsed = activated.elapsed();
                    match result {
                        Ok(()) => status.state = DestinationState::Done,
                        Err(error) => {
                            status.state = DestinationState::Failed;
                            status.error = Some(error);
                        }
                    }
                }
            })
            .buffer_unordered(self.fanout_width)
            .for_each(|()| futures::future::ready(()))
            .await;

        let statuses = statuses
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        assert!(statuses.iter().all(|s| s.state.is_terminal()));
        let report = DispatchReport {
            kind: message.kind(),
            statuses,
            elapsed: start.elapsed(),
        };
        log::debug!(
            "{} for step {} finished in {:?}: {} done, {} failed",
            report.kind,
            message.step_key(),
            report.elapsed,
            report.done_count(),
            report.exit_code()
        );
        report
    }
}

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tokio::sync::watch;
use tokio::time::Instant;

use gantry::StepKey;
use gantry::agent::{
    Agent, AgentMessage, AgentPayload, AgentTransport, Destination, DispatchReport,
};
use gantry::credential::Signature;
use gantry::server::StepLaunchInfo;

use crate::launch::env::TaskEnvironment;
use crate::launch::iomux::{IoMultiplexer, IoStats};
use crate::launch::signals::{
    FORWARDED_SIGNALS, LaunchTracker, SignalAction, SignalBroker, SignalPolicy, forward_signal,
    signal_name,
};

/// State of a launched step as seen by the launcher. It only moves forward.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobPhase {
    Running,
    /// Interrupted twice; the launcher stops waiting for the tasks.
    Overdone,
    Done,
}

/// Launcher side of one step: task environment, I/O forwarding and signals.
pub struct LaunchSession {
    key: StepKey,
    environment: TaskEnvironment,
    signature: Signature,
    destinations: Vec<Destination>,
    tracker: LaunchTracker,
    label: bool,
    phase: watch::Sender<JobPhase>,
}

impl LaunchSession {
    pub fn new(info: &StepLaunchInfo) -> Self {
        let (phase, _) = watch::channel(JobPhase::Running);
        LaunchSession {
            key: info.key(),
            environment: TaskEnvironment::from_launch(info),
            signature: info.credential.signature(),
            destinations: info.destinations.clone(),
            tracker: LaunchTracker::default(),
            label: false,
            phase,
        }
    }

    pub fn with_labels(mut self, label: bool) -> Self {
        self.label = label;
        self
    }

    pub fn key(&self) -> StepKey {
        self.key
    }

    pub fn environment(&self) -> &TaskEnvironment {
        &self.environment
    }

    pub fn destinations(&self) -> &[Destination] {
        &self.destinations
    }

    pub fn tracker(&self) -> &LaunchTracker {
        &self.tracker
    }

    pub fn phase(&self) -> JobPhase {
        *self.phase.borrow()
    }

    /// Moves the step to `phase` and wakes everyone waiting on the change.
    /// Returns false when the step is already at or past `phase`.
    pub fn set_phase(&self, phase: JobPhase) -> bool {
        self.phase.send_if_modified(|current| {
            if phase <= *current {
                return false;
            }
            log::debug!("Step {} is {:?}", self.key, phase);
            *current = phase;
            true
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<JobPhase> {
        self.phase.subscribe()
    }

    /// Opens the I/O port the tasks of the step connect to.
    pub async fn bind_io(&self, address: &str) -> crate::Result<IoMultiplexer> {
        let multiplexer =
            IoMultiplexer::bind(address, self.environment.nprocs(), self.signature).await?;
        Ok(multiplexer.with_labels(self.label))
    }

    /// Tells the nodes of the step where to send task I/O. Nodes that
    /// acknowledge become targets of forwarded signals.
    pub async fn attach_streams<T: AgentTransport>(
        &self,
        agent: &Agent<T>,
        addresses: Vec<String>,
    ) -> DispatchReport {
        let message = AgentMessage::new(self.key, AgentPayload::ReattachStreams { addresses });
        let report = agent.dispatch(&message, &self.destinations).await;
        self.tracker.record_launch(&report);
        if report.exit_code() != 0 {
            log::warn!(
                "{} node(s) of step {} did not acknowledge the launch",
                report.exit_code(),
                self.key
            );
            report.log_failures();
        }
        report
    }

    /// Forwards task I/O until all tasks close their streams or the step
    /// stops running. The step is done afterwards.
    pub async fn run_io<I, O, E>(
        &self,
        multiplexer: IoMultiplexer,
        stdin: Option<I>,
        stdout: O,
        stderr: E,
    ) -> crate::Result<IoStats>
    where
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        let mut phase = self.subscribe();
        let stopped = async move {
            let _ = phase.wait_for(|p| *p != JobPhase::Running).await;
        };
        let result = multiplexer.run(stdin, stdout, stderr, stopped).await;
        self.set_phase(JobPhase::Done);
        result
    }

    /// Handles signals caught by the launcher until the step is done or the
    /// signal source goes away.
    pub async fn forward_signals<T: AgentTransport>(
        &self,
        agent: &Agent<T>,
        mut signals: UnboundedReceiver<i32>,
    ) {
        let mut policy = SignalPolicy::default();
        let mut phase = self.subscribe();
        loop {
            let signal = tokio::select! {
                signal = signals.recv() => match signal {
                    Some(signal) => signal,
                    None => break,
                },
                _ = async { let _ = phase.wait_for(|p| *p == JobPhase::Done).await; } => break,
            };
            match policy.decide(signal, self.phase(), Instant::now()) {
                SignalAction::Forward(signal) => {
                    log::info!("Forwarding {} to step {}", signal_name(signal), self.key);
                    forward_signal(agent, self.key, signal, &self.destinations, &self.tracker)
                        .await;
                }
                SignalAction::Overdone => {
                    log::warn!("Interrupted twice, abandoning step {}", self.key);
                    self.set_phase(JobPhase::Overdone);
                }
                SignalAction::Ignore => {
                    log::debug!(
                        "Ignoring {} after step {} stopped",
                        signal_name(signal),
                        self.key
                    );
                }
            }
        }
    }
}

/// Starts catching the signals the launcher forwards to its steps.
pub fn catch_signals() -> crate::Result<(SignalBroker, UnboundedReceiver<i32>)> {
    let (sender, receiver) = unbounded_channel();
    let broker = SignalBroker::start(&FORWARDED_SIGNALS, sender)?;
    Ok((broker, receiver))
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use gantry::credential::SIG_LEN;
    use gantry::server::AgentConfig;
    use gantry::stream::{StreamHeader, StreamType};
    use signal_hook::consts::{SIGINT, SIGTERM};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    use super::*;
    use crate::launch::tests::{RecordingTransport, launch_info};

    async fn connect(
        address: SocketAddr,
        task_id: i32,
        stream_type: StreamType,
        signature: Signature,
    ) -> TcpStream {
        let mut stream = TcpStream::connect(address).await.unwrap();
        stream
            .write_all(&StreamHeader::new(task_id, stream_type, signature).pack())
            .await
            .unwrap();
        stream
    }

    #[test]
    fn test_phase_only_moves_forward() {
        let session = LaunchSession::new(&launch_info(1, 1));
        let receiver = session.subscribe();
        assert_eq!(session.phase(), JobPhase::Running);
        assert!(!session.set_phase(JobPhase::Running));
        assert!(session.set_phase(JobPhase::Overdone));
        assert!(receiver.has_changed().unwrap());
        assert!(!session.set_phase(JobPhase::Running));
        assert!(session.set_phase(JobPhase::Done));
        assert!(!session.set_phase(JobPhase::Overdone));
        assert_eq!(session.phase(), JobPhase::Done);
    }

    #[test]
    fn test_session_of_step() {
        let info = launch_info(2, 4);
        let session = LaunchSession::new(&info);
        assert_eq!(session.key(), info.key());
        assert_eq!(session.environment().nprocs(), 4);
        assert_eq!(session.destinations().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_task_keeps_forwarding_until_stopped() {
        let info = launch_info(3, 3);
        let signature = info.credential.signature();
        let session = LaunchSession::new(&info).with_labels(true);
        let multiplexer = session.bind_io("127.0.0.1:0").await.unwrap();
        let address = multiplexer.local_addr().unwrap();
        let mut stdout = Vec::new();

        let tasks = async {
            let mut out0 = connect(address, 0, StreamType::InOut, signature).await;
            let err0 = connect(address, 0, StreamType::SigErr, signature).await;
            let forged = connect(address, 1, StreamType::InOut, [0; SIG_LEN]).await;
            let out2 = connect(address, 2, StreamType::InOut, signature).await;
            let err2 = connect(address, 2, StreamType::SigErr, signature).await;
            out0.write_all(b"hello\n").await.unwrap();
            drop((out0, err0, forged, out2, err2));

            tokio::time::sleep(Duration::from_millis(200)).await;
            assert_eq!(session.phase(), JobPhase::Running);
            assert!(session.set_phase(JobPhase::Overdone));
        };
        let (stats, ()) = tokio::join!(
            session.run_io(
                multiplexer,
                None::<tokio::io::Empty>,
                &mut stdout,
                tokio::io::sink()
            ),
            tasks
        );
        let stats = stats.unwrap();
        assert_eq!(stats.accepted, 4);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stdout, b"0: hello\n");
        assert_eq!(session.phase(), JobPhase::Done);
    }

    #[tokio::test]
    async fn test_io_completion_finishes_step() {
        let info = launch_info(1, 1);
        let signature = info.credential.signature();
        let session = LaunchSession::new(&info);
        let multiplexer = session.bind_io("127.0.0.1:0").await.unwrap();
        let address = multiplexer.local_addr().unwrap();
        let tasks = async {
            let mut out = connect(address, 0, StreamType::InOut, signature).await;
            let err = connect(address, 0, StreamType::SigErr, signature).await;
            out.write_all(b"done\n").await.unwrap();
            drop((out, err));
        };
        let mut stdout = Vec::new();
        let (stats, ()) = tokio::join!(
            session.run_io(
                multiplexer,
                None::<tokio::io::Empty>,
                &mut stdout,
                tokio::io::sink()
            ),
            tasks
        );
        assert_eq!(stats.unwrap().accepted, 2);
        assert_eq!(stdout, b"done\n");
        assert_eq!(session.phase(), JobPhase::Done);
    }

    #[tokio::test]
    async fn test_signals_reach_acknowledged_nodes() {
        let info = launch_info(2, 2);
        let session = LaunchSession::new(&info);
        let agent = Agent::new(RecordingTransport::default(), &AgentConfig::default());

        let report = session
            .attach_streams(&agent, vec!["client:7000".to_string()])
            .await;
        assert_eq!(report.done_count(), 2);
        assert!(session.tracker().has_replied("n1"));

        let (sender, receiver) = unbounded_channel();
        sender.send(SIGTERM).unwrap();
        sender.send(SIGINT).unwrap();
        sender.send(SIGINT).unwrap();
        sender.send(SIGTERM).unwrap();
        drop(sender);
        session.forward_signals(&agent, receiver).await;

        assert_eq!(session.phase(), JobPhase::Overdone);
        let payloads = agent.transport().payloads();
        let kills: Vec<_> = payloads
            .iter()
            .filter_map(|p| match p {
                AgentPayload::KillTasks { signal } => Some(*signal),
                _ => None,
            })
            .collect();
        // The second interrupt abandons the step, later signals are dropped
        assert_eq!(kills, vec![SIGTERM, SIGTERM, SIGINT, SIGINT]);
        assert_eq!(payloads.len(), 6);
    }

    #[tokio::test]
    async fn test_signal_forwarding_ends_with_step() {
        let session = LaunchSession::new(&launch_info(1, 1));
        let agent = Agent::new(RecordingTransport::default(), &AgentConfig::default());
        let (_sender, receiver) = unbounded_channel();
        let forwarding = session.forward_signals(&agent, receiver);
        let stop = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            session.set_phase(JobPhase::Done);
        };
        tokio::time::timeout(Duration::from_secs(5), async { tokio::join!(forwarding, stop) })
            .await
            .unwrap();
        assert!(agent.transport().payloads().is_empty());
    }
}

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::internal::agent::{Agent, AgentTransport, Destination, DestinationState};
use crate::internal::common::ids::{JobId, StepId, StepKey};
use crate::internal::messages::agent::{AgentMessage, AgentPayload, AgentReply};
use crate::internal::server::config::AgentConfig;

/// Replies after `delay`; addresses starting with `hang` never reply.
#[derive(Default)]
struct SlowTransport {
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl SlowTransport {
    fn new(delay: Duration) -> Self {
        SlowTransport {
            delay,
            ..Default::default()
        }
    }
}

impl AgentTransport for SlowTransport {
    async fn send(&self, address: &str, _message: &AgentMessage) -> crate::Result<AgentReply> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if address.starts_with("hang") {
            futures::future::pending::<()>().await;
        }
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(AgentReply::Ok)
    }
}

fn config(fanout_width: usize, timeout: Duration) -> AgentConfig {
    AgentConfig {
        fanout_width,
        command_timeout: timeout,
        ..Default::default()
    }
}

fn message() -> AgentMessage {
    AgentMessage::new(
        StepKey::new(JobId::new(7), StepId::new(0)),
        AgentPayload::RevokeCredential,
    )
}

fn destinations(count: usize, hanging: &[usize]) -> Vec<Destination> {
    (0..count)
        .map(|i| {
            let address = if hanging.contains(&i) {
                format!("hang{i}:6818")
            } else {
                format!("n{i}:6818")
            };
            Destination::new(format!("n{i}"), address)
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_hanging_nodes_time_out() {
    let agent = Agent::new(
        SlowTransport::new(Duration::from_millis(10)),
        &config(32, Duration::from_secs(3)),
    );
    let hanging = [0, 20, 40, 60, 80];
    let targets = destinations(100, &hanging);

    let report = agent.dispatch(&message(), &targets).await;

    assert!(report.elapsed() >= Duration::from_secs(3));
    assert!(report.elapsed() < Duration::from_secs(4));
    assert_eq!(report.statuses().len(), 100);
    assert!(report.statuses().iter().all(|s| s.state.is_terminal()));
    assert_eq!(report.done_count(), 95);
    assert_eq!(report.exit_code(), 5);
    assert_eq!(
        report.failed_names(),
        vec!["n0", "n20", "n40", "n60", "n80"]
    );
    for status in report.failed() {
        assert_eq!(status.state, DestinationState::Failed);
        assert!(status.error.as_deref().unwrap().contains("no reply within 3s"));
        assert!(status.elapsed >= Duration::from_secs(3));
    }
    report.log_failures();
}

#[tokio::test(start_paused = true)]
async fn test_fanout_width_bounds_in_flight() {
    let agent = Agent::new(
        SlowTransport::new(Duration::from_millis(10)),
        &config(8, Duration::from_secs(3)),
    );
    let report = agent.dispatch(&message(), &destinations(40, &[])).await;
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.done_count(), 40);
    assert_eq!(agent.transport().max_in_flight.load(Ordering::SeqCst), 8);
    // Five waves of eight
    assert!(report.elapsed() >= Duration::from_millis(50));
    assert!(report.elapsed() < Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn test_zero_width_sends_one_at_a_time() {
    let agent = Agent::new(
        SlowTransport::new(Duration::from_millis(10)),
        &config(0, Duration::from_secs(1)),
    );
    assert_eq!(agent.fanout_width(), 1);
    let report = agent.dispatch(&message(), &destinations(3, &[])).await;
    assert_eq!(report.done_count(), 3);
    assert_eq!(agent.transport().max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_all_nodes_hang() {
    let agent = Agent::new(
        SlowTransport::new(Duration::ZERO),
        &config(2, Duration::from_secs(1)),
    );
    let report = agent
        .dispatch(&message(), &destinations(4, &[0, 1, 2, 3]))
        .await;
    assert_eq!(report.exit_code(), 4);
    // Two waves, each cut by the timeout
    assert!(report.elapsed() >= Duration::from_secs(2));
    assert!(report.elapsed() < Duration::from_secs(3));
}

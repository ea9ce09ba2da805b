//! The command dispatcher run by `datasource-manager`.
//!
//! Listens on the manager's command topic, validates each command, starts a
//! job per command, and publishes exactly one response per dispatched job on
//! the command's response channel. Job supervision and response publishing
//! happen in per-job tasks, so a long job never stalls the receive loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use datasource_bus::{BusError, EventPublisher, EventSubscriber, Message};
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::launcher::JobLauncher;
use crate::protocol::{Command, CommandResponse};

/// Pause after a failed receive before trying again.
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// The one topic this dispatcher consumes.
    pub command_topic: String,
    /// Jobs allowed to run at once; `None` for no limit.
    pub max_concurrent_jobs: Option<usize>,
    /// Grace period for in-flight jobs after shutdown is requested.
    pub shutdown_timeout: Duration,
}

impl DispatcherConfig {
    pub fn new(command_topic: impl Into<String>) -> Self {
        Self {
            command_topic: command_topic.into(),
            max_concurrent_jobs: None,
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    pub fn max_concurrent_jobs(mut self, limit: Option<usize>) -> Self {
        self.max_concurrent_jobs = limit;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Lifecycle of a dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    Listening,
    /// Shutdown requested; waiting for in-flight jobs.
    Draining,
    Stopped,
}

/// Counters since start.
#[derive(Debug, Default)]
pub struct DispatcherStats {
    received: AtomicU64,
    malformed: AtomicU64,
    rejected: AtomicU64,
    dispatched: AtomicU64,
    responded: AtomicU64,
}

impl DispatcherStats {
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn responded(&self) -> u64 {
        self.responded.load(Ordering::Relaxed)
    }
}

pub struct Dispatcher {
    config: DispatcherConfig,
    publisher: Arc<dyn EventPublisher>,
    subscriber: Arc<dyn EventSubscriber>,
    launcher: Arc<dyn JobLauncher>,
    permits: Option<Arc<Semaphore>>,
    stats: Arc<DispatcherStats>,
    state: watch::Sender<DispatcherState>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        publisher: Arc<dyn EventPublisher>,
        subscriber: Arc<dyn EventSubscriber>,
        launcher: Arc<dyn JobLauncher>,
    ) -> Self {
        let permits = config
            .max_concurrent_jobs
            .map(|limit| Arc::new(Semaphore::new(limit.max(1))));
        let (state, _) = watch::channel(DispatcherState::Idle);
        Self {
            config,
            publisher,
            subscriber,
            launcher,
            permits,
            stats: Arc::new(DispatcherStats::default()),
            state,
        }
    }

    pub fn command_topic(&self) -> &str {
        &self.config.command_topic
    }

    pub fn stats(&self) -> &Arc<DispatcherStats> {
        &self.stats
    }

    /// Watch the dispatcher's lifecycle state.
    pub fn state(&self) -> watch::Receiver<DispatcherState> {
        self.state.subscribe()
    }

    /// Receive and dispatch commands until `shutdown` is notified.
    ///
    /// Use `notify_one` to request shutdown; a notification sent before
    /// `run` starts waiting is not lost. In-flight jobs get
    /// `shutdown_timeout` to finish and respond, after which they are
    /// aborted and their processes killed.
    pub async fn run(&self, shutdown: Arc<Notify>) -> Result<(), BusError> {
        let stop = shutdown.notified();
        tokio::pin!(stop);
        stop.as_mut().enable();

        self.subscriber.subscribe(&self.config.command_topic).await?;
        self.state.send_replace(DispatcherState::Listening);
        info!(
            topic = %self.config.command_topic,
            max_concurrent_jobs = ?self.config.max_concurrent_jobs,
            "dispatcher listening"
        );

        let mut jobs: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                _ = &mut stop => break,
                Some(joined) = jobs.join_next(), if !jobs.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "job task ended abnormally");
                    }
                }
                received = self.subscriber.recv() => match received {
                    Ok(message) => self.handle_message(message, &mut jobs),
                    Err(e) => {
                        warn!(error = %e, "failed to receive command");
                        tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        self.drain(jobs).await;
        self.state.send_replace(DispatcherState::Stopped);
        info!(
            received = self.stats.received(),
            dispatched = self.stats.dispatched(),
            responded = self.stats.responded(),
            "dispatcher stopped"
        );
        Ok(())
    }

    async fn drain(&self, mut jobs: JoinSet<()>) {
        self.state.send_replace(DispatcherState::Draining);
        if jobs.is_empty() {
            return;
        }

        let in_flight = jobs.len();
        info!(in_flight, timeout = ?self.config.shutdown_timeout, "waiting for in-flight jobs");
        let finished = tokio::time::timeout(self.config.shutdown_timeout, async {
            while jobs.join_next().await.is_some() {}
        })
        .await;

        if finished.is_err() {
            warn!(remaining = jobs.len(), "shutdown timeout reached, aborting jobs");
            jobs.abort_all();
            while jobs.join_next().await.is_some() {}
        }
    }

    fn handle_message(&self, message: Message, jobs: &mut JoinSet<()>) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        // Subscriptions match by prefix; `..._10.0.0.1` also sees `..._10.0.0.12`.
        if message.topic != self.config.command_topic {
            debug!(topic = %message.topic, "ignoring message for another manager");
            return;
        }

        let command = match Command::from_slice(&message.payload) {
            Ok(command) => command,
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, bytes = message.payload.len(), "dropping malformed command");
                debug!(payload = %message.payload_lossy(), "malformed command payload");
                return;
            }
        };

        let job = match command.validate() {
            Ok(job) => job,
            Err(e) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                if command.has_reply_channel() {
                    warn!(request_id = %command.request_id, error = %e, "rejecting command");
                    let response = CommandResponse::rejected(&command, &e);
                    let publisher = self.publisher.clone();
                    let topic = command.response_channel.clone();
                    let stats = self.stats.clone();
                    jobs.spawn(async move {
                        publish_response(&*publisher, &topic, &response).await;
                        stats.responded.fetch_add(1, Ordering::Relaxed);
                    });
                } else {
                    warn!(request_id = %command.request_id, error = %e, "dropping command with no usable response channel");
                }
                return;
            }
        };

        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        info!(
            request_id = %job.request_id,
            datasource = %job.datasource,
            response_channel = %job.response_channel,
            progress_channel = %job.progress_channel,
            "dispatching job"
        );

        let launcher = self.launcher.clone();
        let publisher = self.publisher.clone();
        let permits = self.permits.clone();
        let stats = self.stats.clone();
        jobs.spawn(async move {
            // The semaphore is never closed, so acquiring only fails if it is.
            let permit = match permits {
                Some(semaphore) => semaphore.acquire_owned().await.ok(),
                None => None,
            };

            let response = match launcher.launch(&job).await {
                Ok(outcome) => {
                    if outcome.success() {
                        info!(request_id = %job.request_id, pid = ?outcome.pid, "job succeeded");
                    } else {
                        warn!(
                            request_id = %job.request_id,
                            pid = ?outcome.pid,
                            exit_code = ?outcome.exit_code,
                            signal = ?outcome.signal,
                            "job failed"
                        );
                    }
                    CommandResponse::completed(&job, &outcome)
                }
                Err(e) => {
                    error!(request_id = %job.request_id, error = %e, "job could not be launched");
                    CommandResponse::launch_failed(&job, &e)
                }
            };
            drop(permit);

            publish_response(&*publisher, &job.response_channel, &response).await;
            stats.responded.fetch_add(1, Ordering::Relaxed);
        });
    }
}

async fn publish_response(publisher: &dyn EventPublisher, topic: &str, response: &CommandResponse) {
    let message = match Message::new(topic, response) {
        Ok(message) => message,
        Err(e) => {
            error!(request_id = %response.request_id, error = %e, "failed to encode response");
            return;
        }
    };
    match publisher.publish(message).await {
        Ok(()) => debug!(request_id = %response.request_id, topic, status = ?response.status, "response sent"),
        Err(e) => error!(request_id = %response.request_id, topic, error = %e, "failed to publish response"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::{mpsc, Mutex};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    use crate::error::LaunchError;
    use crate::launcher::JobOutcome;
    use crate::protocol::{HandlerParams, JobSpec, ResponseStatus};

    const TOPIC: &str = "datasource_commands_10.0.0.1";
    const WAIT: Duration = Duration::from_secs(5);

    struct ChannelPublisher {
        tx: mpsc::UnboundedSender<Message>,
    }

    #[async_trait]
    impl EventPublisher for ChannelPublisher {
        async fn publish(&self, message: Message) -> Result<(), BusError> {
            self.tx
                .send(message)
                .map_err(|e| BusError::Transport(e.to_string()))
        }
    }

    struct ChannelSubscriber {
        rx: Mutex<mpsc::UnboundedReceiver<Message>>,
        topics: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventSubscriber for ChannelSubscriber {
        async fn subscribe(&self, topic_prefix: &str) -> Result<(), BusError> {
            self.topics.lock().await.push(topic_prefix.to_string());
            Ok(())
        }

        async fn recv(&self) -> Result<Message, BusError> {
            match self.rx.lock().await.recv().await {
                Some(message) => Ok(message),
                None => std::future::pending().await,
            }
        }
    }

    /// Outcome picked by datasource name: `Crash` exits 2, `Missing` fails to
    /// spawn, anything else succeeds after `delay`.
    struct MockLauncher {
        delay: Duration,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl MockLauncher {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl JobLauncher for MockLauncher {
        async fn launch(&self, job: &JobSpec) -> Result<JobOutcome, LaunchError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            match job.datasource.as_str() {
                "Crash" => Ok(JobOutcome {
                    pid: Some(4242),
                    exit_code: Some(2),
                    signal: None,
                    stderr_tail: vec!["unknown handler 'Crash'".into()],
                }),
                "Missing" => Err(LaunchError::Spawn {
                    program: "datasource-launcher".into(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
                }),
                _ => Ok(JobOutcome {
                    pid: Some(4242),
                    exit_code: Some(0),
                    ..JobOutcome::default()
                }),
            }
        }
    }

    struct Harness {
        inbound: mpsc::UnboundedSender<Message>,
        outbound: mpsc::UnboundedReceiver<Message>,
        shutdown: Arc<Notify>,
        dispatcher: Arc<Dispatcher>,
        launcher: Arc<MockLauncher>,
        task: JoinHandle<Result<(), BusError>>,
    }

    impl Harness {
        fn start(config: DispatcherConfig, delay: Duration) -> Self {
            let (inbound, in_rx) = mpsc::unbounded_channel();
            let (out_tx, outbound) = mpsc::unbounded_channel();
            let launcher = Arc::new(MockLauncher::new(delay));
            let dispatcher = Arc::new(Dispatcher::new(
                config,
                Arc::new(ChannelPublisher { tx: out_tx }),
                Arc::new(ChannelSubscriber {
                    rx: Mutex::new(in_rx),
                    topics: Mutex::new(Vec::new()),
                }),
                launcher.clone(),
            ));
            let shutdown = Arc::new(Notify::new());
            let task = {
                let dispatcher = dispatcher.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { dispatcher.run(shutdown).await })
            };
            Self {
                inbound,
                outbound,
                shutdown,
                dispatcher,
                launcher,
                task,
            }
        }

        fn send_command(&self, datasource: &str, response_channel: &str) -> Command {
            let command = Command::start_data_source(datasource, params(), response_channel, None);
            self.inbound.send(Message::new(TOPIC, &command).unwrap()).unwrap();
            command
        }

        async fn next_response(&mut self) -> (String, CommandResponse) {
            let message = timeout(WAIT, self.outbound.recv())
                .await
                .expect("timed out waiting for a response")
                .expect("publisher channel closed");
            let response = message.decode().unwrap();
            (message.topic, response)
        }

        async fn stop(self) -> Arc<Dispatcher> {
            self.shutdown.notify_one();
            timeout(WAIT, self.task)
                .await
                .expect("dispatcher did not stop")
                .unwrap()
                .unwrap();
            self.dispatcher
        }
    }

    fn params() -> HandlerParams {
        match json!({"n": 3}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn malformed_command_does_not_stop_the_loop() {
        let mut h = Harness::start(DispatcherConfig::new(TOPIC), Duration::ZERO);

        h.inbound
            .send(Message::raw(TOPIC, b"{not json".to_vec()))
            .unwrap();
        let command = h.send_command("EchoHandler", "response_ok");

        let (topic, response) = h.next_response().await;
        assert_eq!(topic, "response_ok");
        assert_eq!(response.request_id, command.request_id);
        assert_eq!(response.status, ResponseStatus::Success);
        assert_eq!(response.pid, Some(4242));

        let dispatcher = h.stop().await;
        assert_eq!(dispatcher.stats().malformed(), 1);
        assert_eq!(dispatcher.stats().dispatched(), 1);
        assert_eq!(dispatcher.stats().received(), 2);
    }

    #[tokio::test]
    async fn unknown_method_is_rejected_on_response_channel() {
        let mut h = Harness::start(DispatcherConfig::new(TOPIC), Duration::ZERO);

        let mut command = Command::start_data_source("EchoHandler", params(), "response_r", None);
        command.method = "stop_data_source".into();
        h.inbound.send(Message::new(TOPIC, &command).unwrap()).unwrap();

        let (topic, response) = h.next_response().await;
        assert_eq!(topic, "response_r");
        assert_eq!(response.status, ResponseStatus::Rejected);
        assert!(response.error.unwrap().contains("stop_data_source"));

        let dispatcher = h.stop().await;
        assert_eq!(dispatcher.stats().rejected(), 1);
        assert_eq!(dispatcher.stats().dispatched(), 0);
    }

    #[tokio::test]
    async fn invalid_command_without_reply_channel_is_dropped() {
        let mut h = Harness::start(DispatcherConfig::new(TOPIC), Duration::ZERO);

        let mut command = Command::start_data_source("EchoHandler", params(), "", None);
        command.method = "reboot".into();
        h.inbound.send(Message::new(TOPIC, &command).unwrap()).unwrap();
        h.send_command("EchoHandler", "response_after");

        let (topic, _) = h.next_response().await;
        assert_eq!(topic, "response_after");
        assert!(timeout(Duration::from_millis(100), h.outbound.recv()).await.is_err());
        h.stop().await;
    }

    #[tokio::test]
    async fn crashed_job_yields_failed_response() {
        let mut h = Harness::start(DispatcherConfig::new(TOPIC), Duration::ZERO);
        h.send_command("Crash", "response_crash");

        let (_, response) = h.next_response().await;
        assert_eq!(response.status, ResponseStatus::Failed);
        assert_eq!(response.exit_code, Some(2));
        assert!(response.error.unwrap().contains("unknown handler 'Crash'"));
        h.stop().await;
    }

    #[tokio::test]
    async fn spawn_failure_yields_failed_response() {
        let mut h = Harness::start(DispatcherConfig::new(TOPIC), Duration::ZERO);
        h.send_command("Missing", "response_missing");

        let (_, response) = h.next_response().await;
        assert_eq!(response.status, ResponseStatus::Failed);
        assert_eq!(response.pid, None);
        assert!(response.error.unwrap().contains("no such file"));
        h.stop().await;
    }

    #[tokio::test]
    async fn commands_for_other_managers_are_ignored() {
        let mut h = Harness::start(DispatcherConfig::new(TOPIC), Duration::ZERO);

        let command = Command::start_data_source("EchoHandler", params(), "response_other", None);
        h.inbound
            .send(Message::new(format!("{TOPIC}2"), &command).unwrap())
            .unwrap();
        assert!(timeout(Duration::from_millis(200), h.outbound.recv()).await.is_err());

        let dispatcher = h.stop().await;
        assert_eq!(dispatcher.stats().received(), 1);
        assert_eq!(dispatcher.stats().dispatched(), 0);
    }

    #[tokio::test]
    async fn concurrent_jobs_each_get_their_own_response() {
        let mut h = Harness::start(DispatcherConfig::new(TOPIC), Duration::from_millis(100));

        let a = h.send_command("EchoHandler", "response_a");
        let b = h.send_command("EchoHandler", "response_b");

        let mut seen = vec![h.next_response().await, h.next_response().await];
        seen.sort_by(|x, y| x.0.cmp(&y.0));
        assert_eq!(seen[0].0, "response_a");
        assert_eq!(seen[0].1.request_id, a.request_id);
        assert_eq!(seen[1].0, "response_b");
        assert_eq!(seen[1].1.request_id, b.request_id);
        assert_eq!(h.launcher.peak.load(Ordering::SeqCst), 2);
        h.stop().await;
    }

    #[tokio::test]
    async fn concurrency_limit_is_enforced() {
        let config = DispatcherConfig::new(TOPIC).max_concurrent_jobs(Some(1));
        let mut h = Harness::start(config, Duration::from_millis(50));

        for i in 0..3 {
            h.send_command("EchoHandler", &format!("response_{i}"));
        }
        for _ in 0..3 {
            assert!(h.next_response().await.1.is_success());
        }
        assert_eq!(h.launcher.peak.load(Ordering::SeqCst), 1);
        h.stop().await;
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_jobs() {
        let mut h = Harness::start(DispatcherConfig::new(TOPIC), Duration::from_millis(200));
        let mut state = h.dispatcher.state();
        timeout(WAIT, state.wait_for(|s| *s == DispatcherState::Listening))
            .await
            .unwrap()
            .unwrap();

        h.send_command("EchoHandler", "response_late");
        tokio::time::sleep(Duration::from_millis(50)).await;

        h.shutdown.notify_one();
        let (topic, response) = h.next_response().await;
        assert_eq!(topic, "response_late");
        assert!(response.is_success());

        timeout(WAIT, h.task).await.unwrap().unwrap().unwrap();
        assert_eq!(*h.dispatcher.state().borrow(), DispatcherState::Stopped);
    }

    #[tokio::test]
    async fn shutdown_timeout_aborts_stuck_jobs() {
        let config = DispatcherConfig::new(TOPIC).shutdown_timeout(Duration::from_millis(50));
        let mut h = Harness::start(config, Duration::from_secs(60));

        h.send_command("EchoHandler", "response_stuck");
        tokio::time::sleep(Duration::from_millis(50)).await;

        h.shutdown.notify_one();
        timeout(WAIT, h.task).await.unwrap().unwrap().unwrap();

        let dispatcher = h.dispatcher;
        assert_eq!(dispatcher.stats().dispatched(), 1);
        assert_eq!(dispatcher.stats().responded(), 0);
        assert_eq!(*dispatcher.state().borrow(), DispatcherState::Stopped);
        assert!(h.outbound.try_recv().is_err());
    }
}

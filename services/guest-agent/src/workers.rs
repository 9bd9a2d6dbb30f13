//! Background workers.
//!
//! Five periodic tasks run beside the control loop: `monitor` (process
//! observability), `environment` (host environment changes),
//! `telemetry-collector` (drains the event channel into the outbox),
//! `telemetry-sender` (ships outbox batches upstream) and `log-collector`
//! (agent directory growth). Workers report nothing back to the loop except
//! liveness: once per iteration the control loop calls
//! [`WorkerSet::ensure_running`] and respawns whichever tasks have died.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::GoalStateClient;
use crate::config::Config;
use crate::telemetry::{TelemetryEvent, TelemetryOperation, TelemetryQueue};

/// Events held for upload before the oldest are dropped.
const OUTBOX_CAP: usize = 1000;

/// Events shipped per upload request.
const SEND_BATCH_MAX: usize = 30;

const MONITOR_PERIOD: Duration = Duration::from_secs(60);
const ENVIRONMENT_PERIOD: Duration = Duration::from_secs(60);
const TELEMETRY_SEND_PERIOD: Duration = Duration::from_secs(60);
const LOG_COLLECT_PERIOD: Duration = Duration::from_secs(3600);

/// How long `stop_all` waits per worker before aborting it.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

type Outbox = Arc<Mutex<VecDeque<TelemetryEvent>>>;

struct Worker {
    name: &'static str,
    factory: Box<dyn Fn() -> JoinHandle<()> + Send>,
    handle: JoinHandle<()>,
    restarts: u32,
}

impl Worker {
    fn spawn(name: &'static str, factory: impl Fn() -> JoinHandle<()> + Send + 'static) -> Self {
        let handle = factory();
        debug!(worker = name, "Spawned background worker");
        Self {
            name,
            factory: Box::new(factory),
            handle,
            restarts: 0,
        }
    }
}

/// The background task set and its restart-on-death supervision.
pub struct WorkerSet {
    workers: Vec<Worker>,
    telemetry: TelemetryQueue,
    outbox: Outbox,
}

impl WorkerSet {
    /// Spawns all five workers. `events` is the receiving end of the
    /// telemetry channel feeding the collector.
    pub fn spawn(
        config: Arc<Config>,
        client: Arc<dyn GoalStateClient>,
        telemetry: TelemetryQueue,
        events: mpsc::UnboundedReceiver<TelemetryEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let outbox: Outbox = Arc::new(Mutex::new(VecDeque::new()));
        let events = Arc::new(Mutex::new(events));

        let workers = vec![
            Worker::spawn("monitor", {
                let shutdown = shutdown.clone();
                move || tokio::spawn(monitor_loop(shutdown.clone()))
            }),
            Worker::spawn("environment", {
                let shutdown = shutdown.clone();
                move || tokio::spawn(environment_loop(shutdown.clone()))
            }),
            Worker::spawn("telemetry-collector", {
                let events = events.clone();
                let collector_outbox = outbox.clone();
                let shutdown = shutdown.clone();
                move || {
                    tokio::spawn(collector_loop(
                        events.clone(),
                        collector_outbox.clone(),
                        shutdown.clone(),
                    ))
                }
            }),
            Worker::spawn("telemetry-sender", {
                let client = client.clone();
                let sender_outbox = outbox.clone();
                let shutdown = shutdown.clone();
                move || {
                    tokio::spawn(sender_loop(
                        client.clone(),
                        sender_outbox.clone(),
                        shutdown.clone(),
                    ))
                }
            }),
            Worker::spawn("log-collector", {
                let lib_dir = config.lib_dir.clone();
                let shutdown = shutdown.clone();
                move || tokio::spawn(log_collector_loop(lib_dir.clone(), shutdown.clone()))
            }),
        ];

        Self {
            workers,
            telemetry,
            outbox,
        }
    }

    /// Respawns workers whose tasks have finished. Called once per control
    /// loop iteration.
    pub fn ensure_running(&mut self) {
        for worker in &mut self.workers {
            if !worker.handle.is_finished() {
                continue;
            }
            worker.restarts += 1;
            let msg = format!("{} worker is not alive, restarting it", worker.name);
            warn!(restarts = worker.restarts, "{msg}");
            self.telemetry
                .report_error(TelemetryOperation::Supervision, &msg);
            worker.handle = (worker.factory)();
        }
    }

    /// Waits for every worker to observe shutdown, aborting stragglers.
    pub async fn stop_all(self) {
        for worker in self.workers {
            let abort = worker.handle.abort_handle();
            if tokio::time::timeout(STOP_TIMEOUT, worker.handle)
                .await
                .is_err()
            {
                warn!(worker = worker.name, "Background worker ignored shutdown, aborting");
                abort.abort();
            }
        }
    }
}

/// A merged collector and sender for the daemon process, which runs no
/// worker set of its own. Drains `events` into a local outbox, ships it
/// every `period` and flushes once more at shutdown.
pub fn spawn_telemetry_forwarder(
    client: Arc<dyn GoalStateClient>,
    mut events: mpsc::UnboundedReceiver<TelemetryEvent>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let outbox: Outbox = Arc::new(Mutex::new(VecDeque::new()));
        let mut interval =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                received = events.recv() => {
                    match received {
                        Some(event) => enqueue(&mut *outbox.lock().await, event),
                        None => {
                            flush_outbox(client.as_ref(), &outbox).await;
                            break;
                        }
                    }
                }
                _ = interval.tick() => {
                    flush_outbox(client.as_ref(), &outbox).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        flush_outbox(client.as_ref(), &outbox).await;
                        break;
                    }
                }
            }
        }
        debug!("Telemetry forwarder stopped");
    })
}

async fn monitor_loop(mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(MONITOR_PERIOD);
    let started = Instant::now();

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match crate::resources::rss_bytes() {
                    Ok(rss) => debug!(
                        rss_bytes = rss,
                        uptime_secs = started.elapsed().as_secs(),
                        "Agent process stats"
                    ),
                    Err(e) => debug!(error = %e, "Failed to sample process stats"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Monitor worker stopped");
}

async fn environment_loop(mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(ENVIRONMENT_PERIOD);
    let mut hostname = read_hostname();

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let current = read_hostname();
                if let (Some(previous), Some(current)) = (&hostname, &current) {
                    if previous != current {
                        info!("Detected hostname change: {previous} -> {current}");
                    }
                }
                hostname = current;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Environment worker stopped");
}

async fn collector_loop(
    events: Arc<Mutex<mpsc::UnboundedReceiver<TelemetryEvent>>>,
    outbox: Outbox,
    mut shutdown: watch::Receiver<bool>,
) {
    // Held for the lifetime of the task; a respawn re-acquires it.
    let mut events = events.lock().await;

    loop {
        tokio::select! {
            received = events.recv() => {
                match received {
                    Some(event) => enqueue(&mut *outbox.lock().await, event),
                    None => break,
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Telemetry collector stopped");
}

async fn sender_loop(
    client: Arc<dyn GoalStateClient>,
    outbox: Outbox,
    mut shutdown: watch::Receiver<bool>,
) {
    // First send after one full period; there is nothing queued at startup.
    let mut interval = tokio::time::interval_at(
        tokio::time::Instant::now() + TELEMETRY_SEND_PERIOD,
        TELEMETRY_SEND_PERIOD,
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                flush_outbox(client.as_ref(), &outbox).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    // Final flush so shutdown does not strand queued events.
                    flush_outbox(client.as_ref(), &outbox).await;
                    break;
                }
            }
        }
    }
    debug!("Telemetry sender stopped");
}

async fn log_collector_loop(lib_dir: PathBuf, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(LOG_COLLECT_PERIOD);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match dir_stats(&lib_dir) {
                    Ok((files, bytes)) => debug!(
                        files,
                        bytes,
                        dir = %lib_dir.display(),
                        "Agent directory usage"
                    ),
                    Err(e) => debug!(error = %e, "Failed to measure the agent directory"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Log collector stopped");
}

fn enqueue(outbox: &mut VecDeque<TelemetryEvent>, event: TelemetryEvent) {
    if outbox.len() >= OUTBOX_CAP {
        outbox.pop_front();
    }
    outbox.push_back(event);
}

/// Ships queued events in bounded batches; a failed batch is dropped after
/// a warning. Returns how many events went out.
async fn flush_outbox(client: &dyn GoalStateClient, outbox: &Outbox) -> usize {
    let mut sent = 0;

    loop {
        let batch: Vec<TelemetryEvent> = {
            let mut outbox = outbox.lock().await;
            let take = outbox.len().min(SEND_BATCH_MAX);
            outbox.drain(..take).collect()
        };
        if batch.is_empty() {
            return sent;
        }

        match client.send_telemetry(&batch).await {
            Ok(()) => sent += batch.len(),
            Err(e) => {
                warn!(dropped = batch.len(), error = %e, "Failed to ship telemetry batch");
                return sent;
            }
        }
    }
}

fn read_hostname() -> Option<String> {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|s| s.trim().to_string())
}

fn dir_stats(dir: &Path) -> std::io::Result<(u64, u64)> {
    let mut files = 0u64;
    let mut bytes = 0u64;
    let mut stack = vec![dir.to_path_buf()];

    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                files += 1;
                bytes += meta.len();
            }
        }
    }

    Ok((files, bytes))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tempfile::TempDir;

    use super::*;
    use crate::client::MockGoalStateClient;
    use vega_version::AgentVersion;

    fn version() -> AgentVersion {
        "2.1.0.0".parse().unwrap()
    }

    fn event(message: &str) -> TelemetryEvent {
        TelemetryEvent {
            occurred_at: Utc::now(),
            agent_version: version(),
            operation: TelemetryOperation::HeartBeat,
            is_success: true,
            message: message.to_string(),
        }
    }

    fn spawn_set() -> (
        WorkerSet,
        TelemetryQueue,
        Arc<MockGoalStateClient>,
        watch::Sender<bool>,
        TempDir,
    ) {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::defaults();
        config.lib_dir = tmp.path().to_path_buf();

        let client = Arc::new(MockGoalStateClient::new());
        let (telemetry, events) = TelemetryQueue::channel(version());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let set = WorkerSet::spawn(
            Arc::new(config),
            client.clone(),
            telemetry.clone(),
            events,
            shutdown_rx,
        );
        (set, telemetry, client, shutdown_tx, tmp)
    }

    #[test]
    fn outbox_drops_oldest_beyond_cap() {
        let mut outbox = VecDeque::new();
        for i in 0..(OUTBOX_CAP + 5) {
            enqueue(&mut outbox, event(&format!("e{i}")));
        }

        assert_eq!(outbox.len(), OUTBOX_CAP);
        assert_eq!(outbox.front().unwrap().message, "e5");
    }

    #[test]
    fn dir_stats_counts_nested_files() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a"), b"12345").unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub/b"), b"123").unwrap();

        assert_eq!(dir_stats(tmp.path()).unwrap(), (2, 8));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn hostname_is_readable() {
        let hostname = read_hostname().unwrap();
        assert!(!hostname.is_empty());
    }

    #[tokio::test]
    async fn all_workers_start_alive() {
        let (mut set, _telemetry, _client, _shutdown, _tmp) = spawn_set();
        tokio::time::sleep(Duration::from_millis(20)).await;

        set.ensure_running();

        assert_eq!(set.workers.len(), 5);
        assert!(set.workers.iter().all(|w| w.restarts == 0));
    }

    #[tokio::test]
    async fn dead_worker_is_respawned() {
        let (mut set, _telemetry, _client, _shutdown, _tmp) = spawn_set();

        set.workers[0].handle.abort();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(set.workers[0].handle.is_finished());

        set.ensure_running();

        assert!(!set.workers[0].handle.is_finished());
        assert_eq!(set.workers[0].restarts, 1);
    }

    #[tokio::test]
    async fn events_flow_into_outbox_and_ship() {
        let (set, telemetry, client, _shutdown, _tmp) = spawn_set();

        telemetry.report_success(TelemetryOperation::HeartBeat, "beat");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(set.outbox.lock().await.len(), 1);

        let shipped = flush_outbox(client.as_ref(), &set.outbox).await;
        assert_eq!(shipped, 1);
        assert_eq!(client.telemetry().len(), 1);
        assert!(set.outbox.lock().await.is_empty());
    }

    #[tokio::test]
    async fn flush_sends_in_bounded_batches() {
        let client = MockGoalStateClient::new();
        let outbox: Outbox = Arc::new(Mutex::new(VecDeque::new()));
        {
            let mut outbox = outbox.lock().await;
            for i in 0..(SEND_BATCH_MAX + 3) {
                enqueue(&mut outbox, event(&format!("e{i}")));
            }
        }

        let shipped = flush_outbox(&client, &outbox).await;

        assert_eq!(shipped, SEND_BATCH_MAX + 3);
        assert_eq!(client.telemetry().len(), SEND_BATCH_MAX + 3);
    }

    #[tokio::test]
    async fn shutdown_stops_all_workers() {
        let (set, _telemetry, _client, shutdown_tx, _tmp) = spawn_set();

        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), set.stop_all())
            .await
            .expect("workers should observe shutdown promptly");
    }

    #[tokio::test]
    async fn forwarder_flushes_pending_events_at_shutdown() {
        let client = Arc::new(MockGoalStateClient::new());
        let (telemetry, events) = TelemetryQueue::channel(version());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = spawn_telemetry_forwarder(
            client.clone(),
            events,
            Duration::from_secs(3600),
            shutdown_rx,
        );

        telemetry.report_success(TelemetryOperation::Supervision, "launched");
        telemetry.report_success(TelemetryOperation::Supervision, "exited");
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("forwarder should observe shutdown promptly")
            .unwrap();

        assert_eq!(client.telemetry().len(), 2);
    }
}

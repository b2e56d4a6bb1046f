//! Session bookkeeping and counter emission for the proxy.
//!
//! Every request-path hook is cheap: at most one map insert under the
//! session lock, then a fire-and-forget call into the metrics sink. A
//! background reporter drops idle sessions and publishes gauges.

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{sync::oneshot, task::JoinHandle, time::{Instant, MissedTickBehavior, interval_at}};
use tracing::debug;

mod sink;

pub use sink::{MetricsSink, NoopSink, StatsdSink};

pub const CONNECTIONS: &str = "connections";
pub const CONNECTIONS_BLOCKED: &str = "connections.blocked";
pub const TRAFFIC_UPLOADED: &str = "traffic.uploaded";
pub const TRAFFIC_DOWNLOADED: &str = "traffic.download";
pub const ACTIVE_SESSIONS: &str = "active_sessions";
pub const CLIENT_CONNECTIONS: &str = "client_connections";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsConfig {
    /// Period of the eviction and reporting pass.
    pub eviction_interval: Duration,
    /// Sessions idle for longer than this are forgotten.
    pub idle_threshold: Duration,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            eviction_interval: Duration::from_secs(10),
            idle_threshold: Duration::from_secs(30),
        }
    }
}

/// Outcome of one eviction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    pub evicted: usize,
    pub active_sessions: usize,
    pub client_connections: i64,
}

#[derive(Debug, Default)]
struct Sessions {
    last_seen: HashMap<String, Instant>,
    open: i64,
}

pub struct SessionStats {
    sink: Arc<dyn MetricsSink>,
    config: StatsConfig,
    sessions: Mutex<Sessions>,
}

fn as_amount(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

impl SessionStats {
    pub fn new(sink: Arc<dyn MetricsSink>, config: StatsConfig) -> Self {
        Self {
            sink,
            config,
            sessions: Mutex::new(Sessions::default()),
        }
    }

    pub fn on_session_started(&self) {
        self.sessions.lock().open += 1;
        self.sink.increment_counter(CONNECTIONS, 1);
    }

    /// Only adjusts the open-session count; the reporter publishes it.
    pub fn on_session_finished(&self) {
        self.sessions.lock().open -= 1;
    }

    pub fn on_session_blocked(&self) {
        self.sink.increment_counter(CONNECTIONS_BLOCKED, 1);
    }

    /// Marks `session` as alive now and counts the bytes.
    pub fn on_upload_bytes(&self, session: &str, bytes: u64) {
        let now = Instant::now();
        {
            let mut sessions = self.sessions.lock();
            match sessions.last_seen.get_mut(session) {
                Some(last_seen) => *last_seen = now,
                None => {
                    sessions.last_seen.insert(session.to_owned(), now);
                }
            }
        }
        self.sink.increment_counter(TRAFFIC_UPLOADED, as_amount(bytes));
    }

    /// Counts the bytes without touching session liveness: a session that
    /// only receives data is still evicted once its uploads go quiet.
    pub fn on_download_bytes(&self, bytes: u64) {
        self.sink.increment_counter(TRAFFIC_DOWNLOADED, as_amount(bytes));
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().last_seen.len()
    }

    pub fn open_connections(&self) -> i64 {
        self.sessions.lock().open
    }

    /// Drops sessions idle beyond the threshold, then publishes the
    /// `active_sessions` and `client_connections` gauges.
    pub fn evict_idle(&self) -> Report {
        let report = {
            let mut sessions = self.sessions.lock();
            let now = Instant::now();
            let threshold = self.config.idle_threshold;
            let before = sessions.last_seen.len();

            sessions
                .last_seen
                .retain(|_, last_seen| now.saturating_duration_since(*last_seen) <= threshold);

            Report {
                evicted: before - sessions.last_seen.len(),
                active_sessions: sessions.last_seen.len(),
                client_connections: sessions.open,
            }
        };

        self.sink.send_gauge(ACTIVE_SESSIONS, report.active_sessions as i64);
        self.sink.send_gauge(CLIENT_CONNECTIONS, report.client_connections);
        report
    }

    /// Starts the periodic eviction pass. The first pass runs one interval
    /// after this call; the task stops when the handle is shut down or
    /// dropped.
    pub fn spawn_reporter(self: &Arc<Self>) -> ReporterHandle {
        let (shutdown, stop) = oneshot::channel();
        let task = tokio::spawn(run_reporter(self.clone(), stop));
        ReporterHandle { shutdown, task }
    }
}

async fn run_reporter(stats: Arc<SessionStats>, mut stop: oneshot::Receiver<()>) {
    // interval_at panics on a zero period
    let period = stats.config.eviction_interval.max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = ticker.tick() => {
                let report = stats.evict_idle();
                debug!(
                    "Active sessions: {}, client connections: {}, evicted: {}",
                    report.active_sessions, report.client_connections, report.evicted
                );
            }
        }
    }

    debug!("Session reporter stopped");
}

pub struct ReporterHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ReporterHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Metric {
        Counter(String, i64),
        Gauge(String, i64),
    }

    #[derive(Default)]
    struct RecordingSink {
        metrics: Mutex<Vec<Metric>>,
    }

    impl RecordingSink {
        fn take(&self) -> Vec<Metric> {
            std::mem::take(&mut *self.metrics.lock())
        }

        fn counter_total(&self, name: &str) -> i64 {
            self.metrics
                .lock()
                .iter()
                .map(|m| match m {
                    Metric::Counter(n, amount) if n == name => *amount,
                    _ => 0,
                })
                .sum()
        }
    }

    impl MetricsSink for RecordingSink {
        fn increment_counter(&self, name: &str, amount: i64) {
            self.metrics.lock().push(Metric::Counter(name.to_string(), amount));
        }

        fn send_gauge(&self, name: &str, value: i64) {
            self.metrics.lock().push(Metric::Gauge(name.to_string(), value));
        }
    }

    fn recording(config: StatsConfig) -> (Arc<RecordingSink>, Arc<SessionStats>) {
        let sink = Arc::new(RecordingSink::default());
        let stats = Arc::new(SessionStats::new(sink.clone(), config));
        (sink, stats)
    }

    fn counter(name: &str, amount: i64) -> Metric {
        Metric::Counter(name.to_string(), amount)
    }

    fn gauge(name: &str, value: i64) -> Metric {
        Metric::Gauge(name.to_string(), value)
    }

    #[test]
    fn test_lifecycle_hooks_emit_counters() {
        let (sink, stats) = recording(StatsConfig::default());

        stats.on_session_started();
        stats.on_session_started();
        stats.on_session_blocked();
        stats.on_upload_bytes("10.0.0.1:50000", 120);
        stats.on_download_bytes(4096);
        stats.on_session_finished();

        assert_eq!(sink.take(), vec![
            counter(CONNECTIONS, 1),
            counter(CONNECTIONS, 1),
            counter(CONNECTIONS_BLOCKED, 1),
            counter(TRAFFIC_UPLOADED, 120),
            counter(TRAFFIC_DOWNLOADED, 4096),
        ]);
        assert_eq!(stats.open_connections(), 1);
    }

    #[test]
    fn test_only_uploads_track_sessions() {
        let (_, stats) = recording(StatsConfig::default());

        stats.on_download_bytes(10);
        assert_eq!(stats.active_sessions(), 0);

        stats.on_upload_bytes("10.0.0.1:50000", 10);
        stats.on_upload_bytes("10.0.0.1:50000", 10);
        stats.on_upload_bytes("10.0.0.2:50000", 10);
        assert_eq!(stats.active_sessions(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sessions_are_evicted() {
        let (sink, stats) = recording(StatsConfig::default());

        stats.on_session_started();
        stats.on_upload_bytes("idle", 1);
        tokio::time::advance(Duration::from_secs(20)).await;
        stats.on_upload_bytes("busy", 1);
        tokio::time::advance(Duration::from_secs(15)).await;
        sink.take();

        let report = stats.evict_idle();
        assert_eq!(report, Report { evicted: 1, active_sessions: 1, client_connections: 1 });
        assert_eq!(sink.take(), vec![gauge(ACTIVE_SESSIONS, 1), gauge(CLIENT_CONNECTIONS, 1)]);

        // Exactly at the threshold is not "older than" it.
        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(stats.evict_idle().evicted, 0);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(stats.evict_idle().evicted, 1);
        assert_eq!(stats.active_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recent_upload_keeps_session_alive() {
        let (_, stats) = recording(StatsConfig::default());

        stats.on_upload_bytes("client", 1);
        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(25)).await;
            stats.on_upload_bytes("client", 1);
            stats.on_download_bytes(1);
            assert_eq!(stats.evict_idle().active_sessions, 1);
        }

        // Downloads alone do not refresh liveness.
        tokio::time::advance(Duration::from_secs(25)).await;
        stats.on_download_bytes(1);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(stats.evict_idle().active_sessions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reporter_runs_periodically_and_stops() {
        let (sink, stats) = recording(StatsConfig::default());
        let reporter = stats.spawn_reporter();

        stats.on_session_started();
        stats.on_upload_bytes("client", 1);
        sink.take();

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(sink.take(), vec![gauge(ACTIVE_SESSIONS, 1), gauge(CLIENT_CONNECTIONS, 1)]);

        stats.on_session_finished();
        tokio::time::sleep(Duration::from_secs(30)).await;
        let metrics = sink.take();
        assert_eq!(metrics.len(), 6);
        assert_eq!(&metrics[4..], &[gauge(ACTIVE_SESSIONS, 0), gauge(CLIENT_CONNECTIONS, 0)]);

        reporter.shutdown().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_concurrent_uploads_then_eviction() {
        let config = StatsConfig {
            eviction_interval: Duration::from_millis(100),
            idle_threshold: Duration::from_millis(500),
        };
        let (sink, stats) = recording(config);

        let workers: Vec<_> = (0..16)
            .map(|i| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    let session = format!("10.0.0.{i}:40000");
                    stats.on_session_started();
                    for _ in 0..100 {
                        stats.on_upload_bytes(&session, 10);
                        stats.on_download_bytes(20);
                    }
                    stats.on_session_finished();
                })
            })
            .collect();

        // Concurrent passes must not disturb fresh sessions.
        for _ in 0..5 {
            stats.evict_idle();
        }
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(stats.active_sessions(), 16);
        assert_eq!(stats.open_connections(), 0);
        assert_eq!(sink.counter_total(TRAFFIC_UPLOADED), 16 * 100 * 10);
        assert_eq!(sink.counter_total(TRAFFIC_DOWNLOADED), 16 * 100 * 20);
        assert_eq!(sink.counter_total(CONNECTIONS), 16);

        std::thread::sleep(Duration::from_millis(600));
        let report = stats.evict_idle();
        assert_eq!(report.evicted, 16);
        assert_eq!(stats.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_sink_does_not_affect_hooks() {
        let sink = Arc::new(StatsdSink::connect("nowhere", None).await);
        let stats = Arc::new(SessionStats::new(sink, StatsConfig::default()));

        stats.on_session_started();
        stats.on_session_blocked();
        stats.on_upload_bytes("client", 1);
        stats.on_download_bytes(1);
        stats.on_session_finished();
        assert_eq!(stats.evict_idle().active_sessions, 1);

        let stats = SessionStats::new(Arc::new(NoopSink), StatsConfig::default());
        stats.on_upload_bytes("client", u64::MAX);
        assert_eq!(stats.active_sessions(), 1);
    }
}

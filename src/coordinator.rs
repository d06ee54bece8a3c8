use crate::config::Config;
use crate::mqtt::{BrokerLink, LinkState, MqttSource, UplinkHandler};
use crate::pipeline::{IngestStats, SinkEvent, SinkSummary, SinkWriter, StatsSnapshot};
use crate::replay::{replay, ReplaySummary};
use crate::store::PointStore;
use anyhow::Result;
use futures::future;
use serde::Serialize;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// Every shutdown step finished within its timeout.
    pub clean: bool,
    pub sink: Option<SinkSummary>,
    pub replay: Option<ReplaySummary>,
    pub stats: StatsSnapshot,
}

/// Wires a source to one sink writer and runs the ordered shutdown.
pub struct Coordinator {
    config: Config,
    store: Arc<dyn PointStore>,
    stats: Arc<IngestStats>,
}

impl Coordinator {
    pub fn new(config: Config, store: Arc<dyn PointStore>) -> Self {
        Self {
            config,
            store,
            stats: Arc::new(IngestStats::new()),
        }
    }

    fn spawn_sink(&self) -> (SinkWriter, JoinHandle<()>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let writer = SinkWriter::spawn(
            self.store.clone(),
            &self.config.sink,
            self.stats.clone(),
            Some(events_tx),
        );
        (writer, tokio::spawn(report_failures(events_rx)))
    }

    /// Subscribes to the broker until `shutdown` resolves, then stops the
    /// source, drains the sink and releases the broker connection, in that order.
    pub async fn run_live(self, shutdown: impl Future<Output = ()>) -> Result<ShutdownReport> {
        let mqtt = self.config.mqtt()?;
        let source = MqttSource::new(mqtt, self.stats.clone())?;

        let (writer, reporter) = self.spawn_sink();
        let handler = UplinkHandler::new(source.filters().to_vec(), writer.handle());
        let cancel = CancellationToken::new();
        tracing::info!(
            host = %mqtt.host,
            port = mqtt.port,
            topics = ?source.filters(),
            "starting live ingestion"
        );
        let mut source_task = tokio::spawn(source.run(handler, cancel.clone()));

        let source_exited = tokio::select! {
            _ = shutdown => {
                tracing::info!("shutdown signal received");
                false
            }
            res = &mut source_task => {
                // The source only returns after cancellation, so this is a crash.
                if let Err(err) = res {
                    tracing::error!(error=%err, "MQTT source task failed");
                }
                true
            }
        };

        Ok(self
            .stop_live(cancel, source_task, source_exited, writer, reporter)
            .await)
    }

    /// Cancels the source, drains the sink, then releases the broker link.
    /// Each step gets `shutdown_timeout`; a source that already exited is a crash.
    async fn stop_live<L: BrokerLink>(
        &self,
        cancel: CancellationToken,
        mut source_task: JoinHandle<L>,
        source_exited: bool,
        writer: SinkWriter,
        reporter: JoinHandle<()>,
    ) -> ShutdownReport {
        let step_timeout = self.config.shutdown_timeout();
        let mut clean = !source_exited;

        cancel.cancel();
        let link = if source_exited {
            None
        } else {
            match timeout(step_timeout, &mut source_task).await {
                Ok(Ok(link)) => Some(link),
                Ok(Err(err)) => {
                    tracing::error!(error=%err, "MQTT source task failed");
                    clean = false;
                    None
                }
                Err(_) => {
                    tracing::warn!(
                        timeout_ms = step_timeout.as_millis() as u64,
                        "MQTT source did not stop in time"
                    );
                    source_task.abort();
                    clean = false;
                    None
                }
            }
        };

        let sink = close_sink(writer, reporter, step_timeout).await;
        clean &= sink.is_some();

        match link {
            Some(link) => link.release(step_timeout).await,
            None => self.stats.set_link_state(LinkState::Closed),
        }

        ShutdownReport {
            clean,
            sink,
            replay: None,
            stats: self.stats.snapshot(),
        }
    }

    /// Replays `path`. A shutdown signal stops reading and drains what was queued.
    pub async fn run_replay(
        self,
        path: &Path,
        shutdown: impl Future<Output = ()>,
    ) -> Result<ShutdownReport> {
        let step_timeout = self.config.shutdown_timeout();
        let (writer, reporter) = self.spawn_sink();
        let cancel = CancellationToken::new();
        tracing::info!(path = %path.display(), "starting replay");

        let run = replay(path, writer, cancel.clone());
        tokio::pin!(run);
        tokio::pin!(shutdown);

        let mut clean = true;
        let summary = tokio::select! {
            result = &mut run => Some(result?),
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received; stopping replay");
                cancel.cancel();
                match timeout(step_timeout, &mut run).await {
                    Ok(result) => Some(result?),
                    Err(_) => {
                        tracing::warn!(
                            timeout_ms = step_timeout.as_millis() as u64,
                            "replay did not drain in time"
                        );
                        clean = false;
                        None
                    }
                }
            }
        };

        if timeout(step_timeout, reporter).await.is_err() {
            tracing::warn!("failure reporter did not finish");
        }

        Ok(ShutdownReport {
            clean,
            sink: None,
            replay: summary,
            stats: self.stats.snapshot(),
        })
    }
}

async fn close_sink(
    writer: SinkWriter,
    reporter: JoinHandle<()>,
    step_timeout: Duration,
) -> Option<SinkSummary> {
    let summary = match timeout(step_timeout, writer.close()).await {
        Ok(summary) => Some(summary),
        Err(_) => {
            tracing::warn!(
                timeout_ms = step_timeout.as_millis() as u64,
                "sink did not drain in time"
            );
            None
        }
    };
    if summary.is_some() && timeout(step_timeout, reporter).await.is_err() {
        tracing::warn!("failure reporter did not finish");
    }
    summary
}

async fn report_failures(mut events: mpsc::UnboundedReceiver<SinkEvent>) {
    let mut dropped_total = 0usize;
    while let Some(event) = events.recv().await {
        match event {
            SinkEvent::BatchFailed {
                points,
                attempts,
                error,
            } => {
                dropped_total += points;
                tracing::error!(
                    points,
                    attempts,
                    dropped_total,
                    error = %error,
                    "dropped measurement batch"
                );
            }
        }
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error=%err, "failed to listen for ctrl-c");
            future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!(error=%err, "failed to listen for SIGTERM");
                future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InfluxConfig, SinkConfig};
    use crate::store::testing::{unavailable, MemoryStore};
    use crate::telemetry::{sample_measurement, DEFAULT_MEASUREMENT_NAME};
    use std::io::Write;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    fn config(max_attempts: u32) -> Config {
        Config {
            mqtt: None,
            influx: InfluxConfig {
                url: "http://localhost:8086".to_string(),
                token: "token".to_string(),
                org: "org".to_string(),
                bucket: "bucket".to_string(),
                measurement: DEFAULT_MEASUREMENT_NAME.to_string(),
                timeout: Duration::from_secs(1),
            },
            sink: SinkConfig {
                batch_size: 10,
                flush_interval_ms: 3_600_000,
                max_attempts,
                retry_base_delay_ms: 1,
                retry_max_delay_ms: 2,
                ..SinkConfig::default()
            },
            shutdown_timeout_ms: 5_000,
            otlp_endpoint: None,
        }
    }

    fn dump(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(contents.as_bytes()).expect("write");
        file
    }

    const FLAT_UPLINK: &str = r#"[{
        "end_device_ids": {"device_id": "dht22", "application_ids": {"application_id": "greenhouse"}},
        "uplink_message": {"f_cnt": 3, "f_port": 1, "decoded_payload": {"temperature": 20.5, "humidity": 40}}
    }]"#;

    #[tokio::test]
    async fn replay_run_reports_a_clean_drain() {
        let store = Arc::new(MemoryStore::default());
        let file = dump(FLAT_UPLINK);

        let report = Coordinator::new(config(3), store.clone())
            .run_replay(file.path(), future::pending::<()>())
            .await
            .expect("replay");

        assert!(report.clean);
        let summary = report.replay.expect("summary");
        assert_eq!(summary.points_written, 2);
        assert_eq!(report.stats.envelopes_received, 1);
        assert_eq!(store.written_points(), 2);
    }

    #[tokio::test]
    async fn dropped_batches_do_not_fail_the_run() {
        let store = Arc::new(MemoryStore::failing_with((0..5).map(|_| unavailable())));
        let file = dump(FLAT_UPLINK);

        let report = Coordinator::new(config(2), store.clone())
            .run_replay(file.path(), future::pending::<()>())
            .await
            .expect("replay");

        assert!(report.clean);
        let summary = report.replay.expect("summary");
        assert_eq!(summary.points_dropped, 2);
        assert_eq!(summary.batches_failed, 1);
        assert_eq!(report.stats.points_dropped, 2);
    }

    #[tokio::test]
    async fn replay_file_errors_are_returned() {
        let store = Arc::new(MemoryStore::default());
        let file = dump("{}");
        let result = Coordinator::new(config(3), store)
            .run_replay(file.path(), future::pending::<()>())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn live_mode_requires_a_broker() {
        let store = Arc::new(MemoryStore::default());
        let result = Coordinator::new(config(3), store)
            .run_live(future::ready(()))
            .await;
        let err = result.expect_err("missing broker");
        assert!(err.to_string().contains("INGEST_MQTT_HOST"));
    }

    /// What the store looked like when the link was released.
    #[derive(Debug, Clone, Copy, PartialEq)]
    struct AtRelease {
        store_closed: bool,
        points_written: usize,
        link_state: LinkState,
    }

    struct RecordingLink {
        store: Arc<MemoryStore>,
        stats: Arc<IngestStats>,
        seen: Arc<Mutex<Option<AtRelease>>>,
    }

    impl BrokerLink for RecordingLink {
        async fn release(self, _limit: Duration) {
            *self.seen.lock().unwrap() = Some(AtRelease {
                store_closed: self.store.closed.load(Ordering::SeqCst),
                points_written: self.store.written_points(),
                link_state: self.stats.link_state(),
            });
            self.stats.set_link_state(LinkState::Closed);
        }
    }

    #[tokio::test]
    async fn live_shutdown_drains_the_sink_before_releasing_the_link() {
        let store = Arc::new(MemoryStore::default());
        let coordinator = Coordinator::new(config(3), store.clone());
        coordinator.stats.set_link_state(LinkState::Connected);
        let (writer, reporter) = coordinator.spawn_sink();
        let handle = writer.handle();
        let seen = Arc::new(Mutex::new(None));
        let link = RecordingLink {
            store: store.clone(),
            stats: coordinator.stats.clone(),
            seen: seen.clone(),
        };

        let cancel = CancellationToken::new();
        let source_cancel = cancel.clone();
        let source_task = tokio::spawn(async move {
            handle
                .enqueue(sample_measurement("1", 20.5))
                .await
                .expect("enqueue");
            source_cancel.cancelled().await;
            link
        });

        let report = coordinator
            .stop_live(cancel, source_task, false, writer, reporter)
            .await;

        assert!(report.clean);
        assert_eq!(report.sink.map(|sink| sink.points_written), Some(1));
        assert_eq!(
            *seen.lock().unwrap(),
            Some(AtRelease {
                store_closed: true,
                points_written: 1,
                link_state: LinkState::Connected,
            })
        );
        assert_eq!(report.stats.link_state, LinkState::Closed);
    }

    #[tokio::test]
    async fn stuck_source_is_unclean_but_the_sink_still_drains() {
        let store = Arc::new(MemoryStore::default());
        let mut config = config(3);
        config.shutdown_timeout_ms = 50;
        let coordinator = Coordinator::new(config, store.clone());
        let (writer, reporter) = coordinator.spawn_sink();
        writer
            .handle()
            .enqueue(sample_measurement("1", 1.0))
            .await
            .expect("enqueue");
        let source_task = tokio::spawn(future::pending::<RecordingLink>());

        let report = coordinator
            .stop_live(CancellationToken::new(), source_task, false, writer, reporter)
            .await;

        assert!(!report.clean);
        assert_eq!(report.sink.map(|sink| sink.points_written), Some(1));
        assert_eq!(store.written_points(), 1);
        assert_eq!(report.stats.link_state, LinkState::Closed);
    }
}

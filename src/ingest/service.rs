use std::io;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use log::{debug, error, info};
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::task::JoinHandle;

use super::error::IngestError;
use super::source::{ByteStream, PortOpener};
use super::types::{EndSlot, IngestMode, IngestStatus, Outputs, Publishers, SessionEvent};
use crate::config::Config;
use crate::store::TelemetryStore;
use crate::telemetry::{capture_time, parser, FrameReader, RawFrame};
use crate::window::LiveWindow;

#[derive(Debug, Default)]
struct Shared {
    status: IngestStatus,
}

#[derive(Debug)]
struct WorkerHandle {
    stop_tx: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

/// Owns the read loop and the start/stop/delete lifecycle.
pub struct IngestionService {
    opener: Arc<dyn PortOpener>,
    store: Arc<TelemetryStore>,
    capacity: usize,
    shared: Arc<StdMutex<Shared>>,
    publishers: Publishers,
    window: Option<Arc<LiveWindow>>,
    worker: Option<WorkerHandle>,
}

impl IngestionService {
    pub fn new(config: &Config, opener: Arc<dyn PortOpener>) -> (Self, Outputs) {
        let (publishers, outputs) = Publishers::channels(&config.channels);
        let service = Self {
            opener,
            store: Arc::new(TelemetryStore::new(config.storage.data_file.clone())),
            capacity: config.window.capacity,
            shared: Arc::new(StdMutex::new(Shared::default())),
            publishers,
            window: None,
            worker: None,
        };
        (service, outputs)
    }

    pub fn status(&self) -> IngestStatus {
        lock(&self.shared).status.clone()
    }

    pub fn store(&self) -> &TelemetryStore {
        &self.store
    }

    /// Live window of the current or most recent session.
    pub fn window(&self) -> Option<Arc<LiveWindow>> {
        self.window.clone()
    }

    /// Opens the link, replays stored history into a fresh window and spawns
    /// the read loop. Returns once the loop is running.
    pub async fn start(&mut self, port: &str, baud: u32) -> Result<(), IngestError> {
        self.reap().await;
        if self.worker.is_some() {
            return Err(IngestError::AlreadyRunning);
        }

        // Taken before the port is opened so a backlog leaves the link untouched.
        let end = self.publishers.reserve_end()?;

        let stream = self
            .opener
            .open(port, baud)
            .map_err(|source| IngestError::Open {
                port: port.to_string(),
                baud,
                source,
            })?;

        // A corrupt log aborts the start; dropping `stream` closes the port.
        let history = self.store.load_all()?;
        let replayed = history.len();
        let window = Arc::new(LiveWindow::new(self.capacity));
        window.extend(history);

        {
            let mut locked = lock(&self.shared);
            locked.status = IngestStatus {
                mode: IngestMode::Running {
                    port: port.to_string(),
                    baud,
                    started: capture_time(),
                },
                last_measurement: window.latest(),
                ..IngestStatus::default()
            };
        }

        info!(
            "Ingesting from {} at {} baud ({} stored measurements replayed)",
            port, baud, replayed
        );
        self.publishers.event(SessionEvent::Started {
            port: port.to_string(),
            baud,
            replayed,
        });

        let (stop_tx, stop_rx) = oneshot::channel();
        let session = Session {
            reader: FrameReader::new(stream),
            store: self.store.clone(),
            window: window.clone(),
            shared: self.shared.clone(),
            publishers: self.publishers.clone(),
            stop_rx,
            end,
        };
        let join = tokio::task::spawn_blocking(move || session.run());

        self.window = Some(window);
        self.worker = Some(WorkerHandle { stop_tx, join });
        Ok(())
    }

    /// Asks the loop to exit after the frame in hand and waits for it. Does
    /// nothing when no session is active.
    pub async fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        {
            let mut locked = lock(&self.shared);
            if matches!(locked.status.mode, IngestMode::Running { .. }) {
                locked.status.mode = IngestMode::Stopping;
            }
        }

        let _ = worker.stop_tx.send(());
        if let Err(e) = worker.join.await {
            error!("Ingestion worker failed: {}", e);
        }

        lock(&self.shared).status.mode = IngestMode::Idle;
    }

    /// Wipes the telemetry log. Only allowed while no session is writing.
    pub async fn delete_history(&mut self) -> Result<(), IngestError> {
        self.reap().await;
        if self.worker.is_some() {
            return Err(IngestError::Busy);
        }
        self.store.clear()?;
        Ok(())
    }

    // Collects a worker whose loop already ended on its own (link lost). The
    // loop marks itself idle just before returning.
    async fn reap(&mut self) {
        let ended = matches!(lock(&self.shared).status.mode, IngestMode::Idle);
        let finished = self
            .worker
            .as_ref()
            .is_some_and(|worker| ended || worker.join.is_finished());
        if finished {
            self.stop().await;
        }
    }
}

struct Session {
    reader: FrameReader<ByteStream>,
    store: Arc<TelemetryStore>,
    window: Arc<LiveWindow>,
    shared: Arc<StdMutex<Shared>>,
    publishers: Publishers,
    stop_rx: oneshot::Receiver<()>,
    end: EndSlot,
}

impl Session {
    fn run(mut self) {
        let result = self.read_loop();

        let Session {
            reader,
            shared,
            end,
            ..
        } = self;
        drop(reader);

        match result {
            Ok(()) => {
                lock(&shared).status.mode = IngestMode::Idle;
                info!("Ingestion stopped");
                Publishers::end(end, SessionEvent::Stopped);
            }
            Err(e) => {
                {
                    let mut locked = lock(&shared);
                    locked.status.mode = IngestMode::Idle;
                    locked.status.last_error = Some(e.to_string());
                }
                error!("Serial link lost: {}", e);
                Publishers::end(
                    end,
                    SessionEvent::LinkLost {
                        error: e.to_string(),
                    },
                );
            }
        }
    }

    fn read_loop(&mut self) -> io::Result<()> {
        loop {
            // A dropped sender means the service itself is gone.
            match self.stop_rx.try_recv() {
                Err(TryRecvError::Empty) => {}
                Ok(()) | Err(TryRecvError::Closed) => return Ok(()),
            }

            if let Some(text) = self.reader.next_frame()? {
                self.handle_frame(text);
            }
        }
    }

    fn handle_frame(&mut self, text: String) {
        let frame = RawFrame::new(text);
        let parsed = parser::parse_frame(&frame.text)
            .and_then(|fields| fields.into_measurement(capture_time()));
        if let Err(rejection) = &parsed {
            debug!("Rejected frame '{}': {}", frame.text, rejection);
        }
        self.publishers.frame(frame);

        let measurement = match parsed {
            Ok(measurement) => measurement,
            Err(_) => {
                let mut locked = lock(&self.shared);
                locked.status.frames_received += 1;
                locked.status.frames_rejected += 1;
                return;
            }
        };

        let write_failed = match self.store.append(std::slice::from_ref(&measurement)) {
            Ok(()) => false,
            Err(e) => {
                error!(
                    "Failed to persist measurement to {}: {}",
                    self.store.path().display(),
                    e
                );
                self.publishers.event(SessionEvent::StorageWriteFailed {
                    measurement: measurement.clone(),
                    error: e.to_string(),
                });
                true
            }
        };

        self.window.push(measurement.clone());
        {
            let mut locked = lock(&self.shared);
            locked.status.frames_received += 1;
            locked.status.measurements_accepted += 1;
            if write_failed {
                locked.status.storage_failures += 1;
            }
            locked.status.last_measurement = Some(measurement);
        }
        self.publishers.snapshot(&self.window);
    }
}

fn lock(shared: &StdMutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::Snapshot;
    use crate::telemetry::Measurement;
    use std::collections::VecDeque;
    use std::io::Read;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;
    use tokio::sync::{mpsc, watch};
    use tokio::time::{sleep, timeout};

    const FULL_FRAME: &str = "S1,V4106,C55,U841,s6835,r-58,n12\n";
    const WAIT: Duration = Duration::from_secs(5);

    enum Chunk {
        Bytes(Vec<u8>),
        Fail(io::ErrorKind),
    }

    /// Byte stream fed by the test; an idle feed looks like a read timeout.
    struct FeedReader {
        rx: std_mpsc::Receiver<Chunk>,
    }

    impl Read for FeedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.rx.recv_timeout(Duration::from_millis(10)) {
                Ok(Chunk::Bytes(bytes)) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Ok(Chunk::Fail(kind)) => Err(io::Error::new(kind, "device unplugged")),
                Err(_) => Err(io::ErrorKind::TimedOut.into()),
            }
        }
    }

    #[derive(Default)]
    struct FakeOpener {
        feeds: StdMutex<VecDeque<std_mpsc::Receiver<Chunk>>>,
    }

    impl FakeOpener {
        fn add_feed(&self) -> std_mpsc::Sender<Chunk> {
            let (tx, rx) = std_mpsc::channel();
            self.feeds.lock().unwrap().push_back(rx);
            tx
        }
    }

    impl PortOpener for FakeOpener {
        fn open(&self, _port: &str, _baud: u32) -> io::Result<ByteStream> {
            let rx = self
                .feeds
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such port"))?;
            Ok(Box::new(FeedReader { rx }))
        }
    }

    fn send(feed: &std_mpsc::Sender<Chunk>, text: &str) {
        feed.send(Chunk::Bytes(text.as_bytes().to_vec())).unwrap();
    }

    async fn next<T>(rx: &mut mpsc::Receiver<T>) -> T {
        timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for output")
            .expect("channel closed")
    }

    async fn next_snapshot(rx: &mut watch::Receiver<Snapshot>) -> Snapshot {
        timeout(WAIT, rx.changed())
            .await
            .expect("timed out waiting for snapshot")
            .expect("snapshot channel closed");
        rx.borrow_and_update().clone()
    }

    async fn wait_idle(service: &IngestionService) {
        timeout(WAIT, async {
            while service.status().mode != IngestMode::Idle {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session never ended");
    }

    fn drain(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn setup() -> (
        tempfile::TempDir,
        Arc<FakeOpener>,
        IngestionService,
        Outputs,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.data_file = dir.path().join("tide_sensor_data.csv");
        config.window.capacity = 100;
        let opener = Arc::new(FakeOpener::default());
        let (service, outputs) = IngestionService::new(&config, opener.clone());
        (dir, opener, service, outputs)
    }

    #[tokio::test]
    async fn test_accepts_and_rejects_frames() {
        let (_dir, opener, mut service, mut outputs) = setup();
        let feed = opener.add_feed();
        service.start("/dev/fake", 115_200).await.unwrap();
        assert!(matches!(
            next(&mut outputs.events).await,
            SessionEvent::Started { replayed: 0, .. }
        ));

        send(&feed, "S1,V4106\n");
        send(&feed, FULL_FRAME);

        assert_eq!(next(&mut outputs.frames).await.text, "S1,V4106");
        assert_eq!(
            next(&mut outputs.frames).await.text,
            "S1,V4106,C55,U841,s6835,r-58,n12"
        );
        let snapshot = next_snapshot(&mut outputs.snapshots).await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].battery_voltage, 4.106);
        assert_eq!(snapshot[0].solar_voltage, 6.835);
        assert_eq!(snapshot[0].ultrasonic_range, 841);
        assert_eq!(snapshot[0].rssi, -58);

        service.stop().await;
        assert_eq!(next(&mut outputs.events).await, SessionEvent::Stopped);

        let status = service.status();
        assert_eq!(status.mode, IngestMode::Idle);
        assert_eq!(status.frames_received, 2);
        assert_eq!(status.frames_rejected, 1);
        assert_eq!(status.measurements_accepted, 1);
        assert_eq!(status.last_error, None);

        let stored = service.store().load_all().unwrap();
        assert_eq!(stored, snapshot);
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let (_dir, opener, mut service, _outputs) = setup();
        service.stop().await;
        service.stop().await;
        assert_eq!(service.status().mode, IngestMode::Idle);

        let _feed = opener.add_feed();
        service.start("/dev/fake", 115_200).await.unwrap();
        service.stop().await;
        service.stop().await;
        assert_eq!(service.status().mode, IngestMode::Idle);
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let (_dir, opener, mut service, _outputs) = setup();
        let _feed = opener.add_feed();
        service.start("/dev/fake", 115_200).await.unwrap();
        assert!(matches!(
            service.start("/dev/fake", 115_200).await,
            Err(IngestError::AlreadyRunning)
        ));
        assert!(matches!(
            service.status().mode,
            IngestMode::Running { baud: 115_200, .. }
        ));
        service.stop().await;
    }

    #[tokio::test]
    async fn test_open_failure_stays_idle() {
        let (_dir, _opener, mut service, _outputs) = setup();
        assert!(matches!(
            service.start("/dev/missing", 9600).await,
            Err(IngestError::Open { baud: 9600, .. })
        ));
        assert_eq!(service.status().mode, IngestMode::Idle);
    }

    #[tokio::test]
    async fn test_cold_replay_seeds_window() {
        let (_dir, opener, mut service, mut outputs) = setup();
        let history: Vec<Measurement> = (0..3)
            .map(|n| Measurement {
                timestamp: capture_time(),
                battery_voltage: 4.0,
                solar_voltage: 5.0,
                ultrasonic_range: n,
                rssi: -70,
            })
            .collect();
        service.store().append(&history).unwrap();

        let feed = opener.add_feed();
        service.start("/dev/fake", 115_200).await.unwrap();
        assert!(matches!(
            next(&mut outputs.events).await,
            SessionEvent::Started { replayed: 3, .. }
        ));
        let window = service.window().unwrap();
        assert_eq!(window.snapshot(), history);
        assert_eq!(service.status().last_measurement, history.last().cloned());

        send(&feed, FULL_FRAME);
        let snapshot = next_snapshot(&mut outputs.snapshots).await;
        assert_eq!(snapshot.len(), 4);
        assert_eq!(&snapshot[..3], &history[..]);
        assert_eq!(snapshot[3].ultrasonic_range, 841);
        service.stop().await;
    }

    #[tokio::test]
    async fn test_link_lost_returns_to_idle() {
        let (_dir, opener, mut service, mut outputs) = setup();
        let feed = opener.add_feed();
        service.start("/dev/fake", 115_200).await.unwrap();
        let _ = next(&mut outputs.events).await;

        send(&feed, FULL_FRAME);
        let _ = next_snapshot(&mut outputs.snapshots).await;
        feed.send(Chunk::Fail(io::ErrorKind::BrokenPipe)).unwrap();

        match next(&mut outputs.events).await {
            SessionEvent::LinkLost { error } => assert!(error.contains("device unplugged")),
            other => panic!("unexpected event: {other:?}"),
        }
        let status = service.status();
        assert_eq!(status.mode, IngestMode::Idle);
        assert!(status.last_error.is_some());

        // The operator can start a new session on the same service.
        let _feed = opener.add_feed();
        service.start("/dev/fake", 115_200).await.unwrap();
        assert!(matches!(
            next(&mut outputs.events).await,
            SessionEvent::Started { replayed: 1, .. }
        ));
        assert_eq!(service.status().last_error, None);
        service.stop().await;
        assert_eq!(next(&mut outputs.events).await, SessionEvent::Stopped);
    }

    #[tokio::test]
    async fn test_delete_history_only_when_idle() {
        let (_dir, opener, mut service, mut outputs) = setup();
        let feed = opener.add_feed();
        service.start("/dev/fake", 115_200).await.unwrap();
        send(&feed, FULL_FRAME);
        let _ = next_snapshot(&mut outputs.snapshots).await;

        assert!(matches!(
            service.delete_history().await,
            Err(IngestError::Busy)
        ));
        assert_eq!(service.store().load_all().unwrap().len(), 1);

        service.stop().await;
        service.delete_history().await.unwrap();
        assert!(service.store().load_all().unwrap().is_empty());

        // The old window is untouched; a new session starts empty.
        assert_eq!(service.window().unwrap().len(), 1);
        let _feed = opener.add_feed();
        service.start("/dev/fake", 115_200).await.unwrap();
        assert!(service.window().unwrap().is_empty());
        service.stop().await;
    }

    #[tokio::test]
    async fn test_corrupt_store_blocks_start() {
        let (_dir, opener, mut service, _outputs) = setup();
        std::fs::write(
            service.store().path(),
            "Timestamp,Battery Voltage (V),Solar Voltage (V),Ultrasonic Range,RSSI\ngarbage,1,2,3,4\n",
        )
        .unwrap();
        let _feed = opener.add_feed();

        match service.start("/dev/fake", 115_200).await {
            Err(IngestError::Store(e)) => assert!(e.is_corrupt()),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(service.status().mode, IngestMode::Idle);
    }

    #[tokio::test]
    async fn test_storage_failure_is_reported() {
        let (_dir, opener, mut service, mut outputs) = setup();
        let feed = opener.add_feed();
        service.start("/dev/fake", 115_200).await.unwrap();
        let _ = next(&mut outputs.events).await;

        // A directory where the log should be makes every append fail.
        std::fs::create_dir(service.store().path()).unwrap();
        send(&feed, FULL_FRAME);

        match next(&mut outputs.events).await {
            SessionEvent::StorageWriteFailed { measurement, .. } => {
                assert_eq!(measurement.ultrasonic_range, 841)
            }
            other => panic!("unexpected event: {other:?}"),
        }
        // The live view still advances.
        assert_eq!(next_snapshot(&mut outputs.snapshots).await.len(), 1);

        service.stop().await;
        let status = service.status();
        assert_eq!(status.storage_failures, 1);
        assert_eq!(status.measurements_accepted, 1);
    }

    #[tokio::test]
    async fn test_frames_dropped_when_consumer_lags() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.data_file = dir.path().join("log.csv");
        config.channels.frames = 1;
        let opener = Arc::new(FakeOpener::default());
        let (mut service, mut outputs) = IngestionService::new(&config, opener.clone());

        let feed = opener.add_feed();
        service.start("/dev/fake", 115_200).await.unwrap();
        send(&feed, "first line\nsecond line\nthird line\n");
        send(&feed, FULL_FRAME);
        // The accepted frame proves the loop got past the earlier lines.
        let _ = next_snapshot(&mut outputs.snapshots).await;
        service.stop().await;

        assert_eq!(next(&mut outputs.frames).await.text, "first line");
        assert!(outputs.frames.try_recv().is_err());
        assert_eq!(service.status().frames_received, 4);
    }

    #[tokio::test]
    async fn test_link_lost_delivered_when_events_backed_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.data_file = dir.path().join("log.csv");
        config.channels.events = 1;
        let opener = Arc::new(FakeOpener::default());
        let (mut service, mut outputs) = IngestionService::new(&config, opener.clone());

        let feed = opener.add_feed();
        service.start("/dev/fake", 115_200).await.unwrap();
        // Every append fails, so the queue fills with write failures.
        std::fs::create_dir(service.store().path()).unwrap();
        for _ in 0..3 {
            send(&feed, FULL_FRAME);
        }
        feed.send(Chunk::Fail(io::ErrorKind::UnexpectedEof)).unwrap();

        // Nobody reads events until the session is over.
        wait_idle(&service).await;
        service.stop().await;
        let events = drain(&mut outputs.events);
        assert_eq!(events.len(), 2, "{events:?}");
        assert!(matches!(events[0], SessionEvent::Started { .. }));
        assert!(matches!(events[1], SessionEvent::LinkLost { .. }));
        assert_eq!(service.status().storage_failures, 3);
    }

    #[tokio::test]
    async fn test_start_refused_until_events_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.data_file = dir.path().join("log.csv");
        config.channels.events = 1;
        let opener = Arc::new(FakeOpener::default());
        let (mut service, mut outputs) = IngestionService::new(&config, opener.clone());

        let _feed = opener.add_feed();
        service.start("/dev/fake", 115_200).await.unwrap();
        service.stop().await;

        // Started and Stopped fill the queue; the next session could not
        // report its end.
        let _feed = opener.add_feed();
        assert!(matches!(
            service.start("/dev/fake", 115_200).await,
            Err(IngestError::EventBacklog)
        ));
        assert_eq!(service.status().mode, IngestMode::Idle);

        assert_eq!(drain(&mut outputs.events).len(), 2);
        service.start("/dev/fake", 115_200).await.unwrap();
        service.stop().await;
        assert_eq!(
            drain(&mut outputs.events).last(),
            Some(&SessionEvent::Stopped)
        );
    }

    #[tokio::test]
    async fn test_lagging_snapshot_consumer_sees_latest() {
        let (_dir, opener, mut service, mut outputs) = setup();
        let feed = opener.add_feed();
        service.start("/dev/fake", 115_200).await.unwrap();
        send(&feed, "S1,V4106,U841,s6835,r-58\n");
        send(&feed, "S1,V4106,U842,s6835,r-58\n");
        send(&feed, "S1,V4106,U843,s6835,r-58\n");
        timeout(WAIT, async {
            while service.status().measurements_accepted < 3 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        service.stop().await;

        let snapshot = next_snapshot(&mut outputs.snapshots).await;
        let ranges: Vec<i64> = snapshot.iter().map(|m| m.ultrasonic_range).collect();
        assert_eq!(ranges, vec![841, 842, 843]);
        assert!(!outputs.snapshots.has_changed().unwrap());
    }
}

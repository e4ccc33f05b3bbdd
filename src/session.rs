//! # Emotion Session
//!
//! The stream loop: one user session of "watch the face, follow the music,
//! commit per song".
//!
//! ## Architecture
//!
//! ```text
//!  capture thread ── Sample ──┐
//!   (camera + sampler)        │
//!                             ├──► bounded queue ──► aggregation thread ──► gateway
//!  poll thread ──── Track ────┘                      (single writer)
//!   (song tracker)
//!                      handle ── CommitNow / Stop ──┘
//! ```
//!
//! Frames and polls run on their own cadences and never wait for each other.
//! Only the aggregation thread touches the tally.
//!
//! ## Stopping
//!
//! A session ends when the caller stops it, when the camera stream ends, or
//! when the camera is lost and cannot be reopened. In every case the final
//! tally is committed exactly once, after any track change that was already
//! queued. [`SessionHandle::stop`] returns only once the final commit has
//! run.
//!
//! Producers get [`SessionConfig::shutdown_grace`] to exit. A camera read
//! that is stuck in the driver is interrupted where the camera supports it;
//! a producer still busy after the grace period is left behind so the final
//! commit is never held up by it. The first stop requested decides the
//! reported [`StopCause`].

use crate::aggregator::{
    AggregatorSnapshot, CommitOutcome, CommitReason, EmotionAggregator, PersistenceGateway,
};
use crate::camera::{Camera, CameraInterrupt, CameraSource};
use crate::config::Settings;
use crate::emotion::{Emotion, EmotionSample};
use crate::now_playing::{NowPlaying, TrackIdentity};
use crate::sampler::{Classifier, EmotionSampler};
use crate::tracker::SongTracker;
use anyhow::{anyhow, bail, Context, Result};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Loop cadences.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub frame_interval: Duration,
    pub poll_interval: Duration,
    pub channel_capacity: usize,
    /// How long stopping waits for the producer threads to exit.
    pub shutdown_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(100),
            poll_interval: Duration::from_secs(1),
            channel_capacity: 256,
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

impl From<&Settings> for SessionConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            frame_interval: settings.frame_interval(),
            poll_interval: settings.poll_interval(),
            channel_capacity: settings.channel_capacity,
            shutdown_grace: settings.shutdown_grace(),
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopCause {
    /// The caller stopped the session.
    Requested,
    /// The user session is going away (Ctrl-C, shutdown).
    Interrupted,
    /// The camera delivered its last frame.
    CameraEnded,
    /// The camera failed and could not be reopened.
    CameraLost,
}

impl StopCause {
    fn commit_reason(self) -> CommitReason {
        match self {
            StopCause::Interrupted => CommitReason::SessionEnd,
            StopCause::Requested | StopCause::CameraEnded | StopCause::CameraLost => {
                CommitReason::StreamStopped
            }
        }
    }
}

#[derive(Debug)]
enum SessionEvent {
    Sample(EmotionSample),
    Track(Option<TrackIdentity>),
    CommitNow,
    Stop(StopCause),
}

/// What a display layer may show while the session runs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionSnapshot {
    pub current_track: Option<TrackIdentity>,
    pub counts: Vec<(Emotion, u32)>,
    pub total: u32,
    pub last_sample: Option<EmotionSample>,
    pub camera_active: bool,
    pub stopped: bool,
}

/// Everything that happened to the tallies during a session.
#[derive(Debug, Default)]
pub struct SessionReport {
    /// Commit outcomes in order; idle commits are left out.
    pub outcomes: Vec<CommitOutcome>,
    pub samples_recorded: u64,
    /// Samples that arrived while nothing was playing.
    pub samples_discarded: u64,
    pub stop_cause: Option<StopCause>,
}

impl SessionReport {
    /// Records that reached the gateway successfully.
    pub fn saved(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_saved()).count()
    }

    fn push(&mut self, outcome: CommitOutcome) {
        if !matches!(outcome, CommitOutcome::Idle) {
            self.outcomes.push(outcome);
        }
    }
}

/// Shared stop request producers can sleep on. The first cause wins.
#[derive(Clone, Default)]
struct StopSignal(Arc<(Mutex<Option<StopCause>>, Condvar)>);

impl StopSignal {
    /// Returns `false` when a stop had already been requested.
    fn request(&self, cause: StopCause) -> bool {
        let (lock, cvar) = &*self.0;
        let first = match lock.lock() {
            Ok(mut requested) => {
                let first = requested.is_none();
                if first {
                    *requested = Some(cause);
                }
                first
            }
            Err(_) => false,
        };
        cvar.notify_all();
        first
    }

    fn requested(&self) -> Option<StopCause> {
        let (lock, _) = &*self.0;
        lock.lock().ok().and_then(|requested| *requested)
    }

    fn is_stopped(&self) -> bool {
        let (lock, _) = &*self.0;
        lock.lock().map(|requested| requested.is_some()).unwrap_or(true)
    }

    /// Sleeps up to `timeout`; returns `true` as soon as a stop is requested.
    fn wait(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.0;
        let Ok(guard) = lock.lock() else {
            return true;
        };
        match cvar.wait_timeout_while(guard, timeout, |requested| requested.is_none()) {
            Ok((requested, _)) => requested.is_some(),
            Err(_) => true,
        }
    }
}

/// Interrupt hook of whichever camera the capture thread holds right now.
type InterruptSlot = Arc<Mutex<Option<CameraInterrupt>>>;

fn arm_interrupt(slot: &InterruptSlot, camera: &dyn Camera) {
    if let Ok(mut current) = slot.lock() {
        *current = camera.interrupt_handle();
    }
}

/// Entry point for running sessions.
pub struct Session;

impl Session {
    /// Opens the camera and starts the loop.
    ///
    /// The classifier inside `sampler` must already be loaded. A camera that
    /// cannot be opened is an error here, before any thread starts.
    pub fn start<C, P, G>(
        config: SessionConfig,
        camera_source: Box<dyn CameraSource>,
        sampler: EmotionSampler<C>,
        now_playing: P,
        aggregator: EmotionAggregator<G>,
    ) -> Result<SessionHandle>
    where
        C: Classifier + 'static,
        P: NowPlaying + 'static,
        G: PersistenceGateway + 'static,
    {
        if config.channel_capacity == 0 {
            bail!("Session channel capacity must be positive");
        }

        let camera = camera_source
            .open()
            .context("Failed to open camera for session")?;

        let stop = StopSignal::default();
        let camera_active = Arc::new(AtomicBool::new(true));
        let snapshot = Arc::new(Mutex::new(SessionSnapshot::default()));
        let interrupt: InterruptSlot = Arc::new(Mutex::new(None));
        arm_interrupt(&interrupt, camera.as_ref());
        let (tx, rx) = mpsc::sync_channel(config.channel_capacity);
        // Disconnects once every producer thread is gone.
        let (done, exited) = mpsc::channel::<()>();

        info!(
            "Starting session for user {} (frames every {:?}, polls every {:?})",
            aggregator.user_id(),
            config.frame_interval,
            config.poll_interval
        );

        let consumer = {
            let snapshot = Arc::clone(&snapshot);
            let stop = stop.clone();
            thread::Builder::new()
                .name("emotune-aggregate".into())
                .spawn(move || aggregate_loop(aggregator, rx, stop, snapshot))
                .context("Failed to spawn aggregation thread")?
        };

        let poller = {
            let tx = tx.clone();
            let stop = stop.clone();
            let done = done.clone();
            let tracker = SongTracker::new(now_playing);
            let interval = config.poll_interval;
            thread::Builder::new()
                .name("emotune-poll".into())
                .spawn(move || {
                    let _done = done;
                    poll_loop(tracker, tx, stop, interval)
                })
                .context("Failed to spawn now-playing thread")?
        };

        let capture = {
            let tx = tx.clone();
            let stop = stop.clone();
            let camera_active = Arc::clone(&camera_active);
            let interrupt = Arc::clone(&interrupt);
            let interval = config.frame_interval;
            thread::Builder::new()
                .name("emotune-capture".into())
                .spawn(move || {
                    let _done = done;
                    let capture = Capture {
                        source: camera_source,
                        sampler,
                        tx,
                        stop,
                        interval,
                        interrupt,
                    };
                    capture.run(camera, &camera_active)
                })
        };
        let capture = match capture {
            Ok(handle) => handle,
            Err(e) => {
                // Lets the poller exit; the consumer follows once all senders are gone.
                stop.request(StopCause::Requested);
                return Err(e).context("Failed to spawn capture thread");
            }
        };

        Ok(SessionHandle {
            stop,
            events: tx,
            snapshot,
            camera_active,
            interrupt,
            exited,
            grace: config.shutdown_grace,
            capture: Some(capture),
            poller: Some(poller),
            consumer: Some(consumer),
        })
    }
}

/// Control surface of a running session.
///
/// Dropping the handle stops the session.
pub struct SessionHandle {
    stop: StopSignal,
    events: SyncSender<SessionEvent>,
    snapshot: Arc<Mutex<SessionSnapshot>>,
    camera_active: Arc<AtomicBool>,
    interrupt: InterruptSlot,
    exited: Receiver<()>,
    grace: Duration,
    capture: Option<JoinHandle<()>>,
    poller: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<SessionReport>>,
}

impl SessionHandle {
    /// Current track and its live counts.
    pub fn snapshot(&self) -> SessionSnapshot {
        let mut snapshot = self
            .snapshot
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        snapshot.camera_active = self.camera_active.load(Ordering::SeqCst);
        snapshot
    }

    /// Commits the playing track's tally now and keeps going.
    pub fn commit_now(&self) -> Result<()> {
        self.events
            .send(SessionEvent::CommitNow)
            .map_err(|_| anyhow!("Session has already stopped"))
    }

    /// Whether the session ended on its own (camera ended or lost).
    pub fn is_finished(&self) -> bool {
        self.consumer
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(true)
    }

    /// Stops the stream and commits the open tally.
    pub fn stop(mut self) -> Result<SessionReport> {
        self.shutdown(StopCause::Requested)
    }

    /// Like [`stop`](Self::stop), for the user session going away.
    pub fn interrupt(mut self) -> Result<SessionReport> {
        self.shutdown(StopCause::Interrupted)
    }

    /// Blocks until the session ends on its own.
    pub fn wait(mut self) -> Result<SessionReport> {
        let report = self.join_consumer();
        self.stop_producers(StopCause::Requested);
        report
    }

    fn shutdown(&mut self, cause: StopCause) -> Result<SessionReport> {
        debug!("Stopping session ({cause:?})");
        self.stop_producers(cause);
        // Whatever a producer left behind still sends after this is ignored.
        let _ = self.events.send(SessionEvent::Stop(cause));
        self.join_consumer()
    }

    /// Requests the stop and joins the producers, waiting at most the grace
    /// period. A producer still running after it is detached.
    fn stop_producers(&mut self, cause: StopCause) {
        self.stop.request(cause);
        let hook = self.interrupt.lock().ok().and_then(|slot| slot.clone());
        if let Some(interrupt) = hook {
            debug!("Interrupting camera read");
            interrupt();
        }

        let all_exited = !matches!(
            self.exited.recv_timeout(self.grace),
            Err(RecvTimeoutError::Timeout)
        );
        for (name, handle) in [("capture", self.capture.take()), ("poll", self.poller.take())] {
            let Some(handle) = handle else {
                continue;
            };
            if !all_exited && !handle.is_finished() {
                warn!(
                    "Session {name} thread did not stop within {:?}, leaving it behind",
                    self.grace
                );
                continue;
            }
            if handle.join().is_err() {
                error!("Session {name} thread panicked");
            }
        }
    }

    fn join_consumer(&mut self) -> Result<SessionReport> {
        let handle = self
            .consumer
            .take()
            .ok_or_else(|| anyhow!("Session already joined"))?;
        let report = handle
            .join()
            .map_err(|_| anyhow!("Session aggregation thread panicked"))?;
        info!(
            "Session stopped ({:?}): {} songs saved, {} samples recorded",
            report.stop_cause,
            report.saved(),
            report.samples_recorded
        );
        Ok(report)
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.consumer.is_some() {
            if let Err(e) = self.shutdown(StopCause::Requested) {
                error!("Failed to stop session cleanly: {e:#}");
            }
        }
    }
}

/// The capture thread's state besides the camera itself.
struct Capture<C: Classifier> {
    source: Box<dyn CameraSource>,
    sampler: EmotionSampler<C>,
    tx: SyncSender<SessionEvent>,
    stop: StopSignal,
    interval: Duration,
    interrupt: InterruptSlot,
}

impl<C: Classifier> Capture<C> {
    fn run(mut self, camera: Box<dyn Camera>, camera_active: &AtomicBool) {
        let cause = self.read_frames(camera);
        // The camera is released by now.
        camera_active.store(false, Ordering::SeqCst);
        if let Ok(mut slot) = self.interrupt.lock() {
            *slot = None;
        }
        // A stop the caller already asked for keeps its own cause.
        if let Some(cause) = cause {
            if self.stop.request(cause) {
                let _ = self.tx.send(SessionEvent::Stop(cause));
            }
        }
    }

    /// Reads frames until stopped. Returns a cause when the camera ended the
    /// session itself.
    fn read_frames(&mut self, mut camera: Box<dyn Camera>) -> Option<StopCause> {
        let mut reopened = false;

        while !self.stop.is_stopped() {
            let started = Instant::now();

            match camera.read_frame() {
                Ok(Some(frame)) => {
                    reopened = false;
                    if let Some(sample) = self.sampler.sample(&frame) {
                        if self.tx.send(SessionEvent::Sample(sample)).is_err() {
                            return None;
                        }
                    }
                }
                Ok(None) if self.stop.is_stopped() => return None,
                Ok(None) => {
                    info!("Camera stream ended");
                    return Some(StopCause::CameraEnded);
                }
                // An interrupted read fails; that is the stop, not a fault.
                Err(_) if self.stop.is_stopped() => return None,
                Err(e) if reopened => {
                    error!("Camera failed again after reopening: {e:#}");
                    return Some(StopCause::CameraLost);
                }
                Err(e) => {
                    warn!("Camera read failed, reopening: {e:#}");
                    drop(camera);
                    match self.source.open() {
                        Ok(fresh) => {
                            arm_interrupt(&self.interrupt, fresh.as_ref());
                            camera = fresh;
                            reopened = true;
                        }
                        Err(e) => {
                            error!("Could not reopen camera: {e:#}");
                            return Some(StopCause::CameraLost);
                        }
                    }
                }
            }

            if self.stop.wait(self.interval.saturating_sub(started.elapsed())) {
                break;
            }
        }

        None
    }
}

fn poll_loop<P: NowPlaying>(
    mut tracker: SongTracker<P>,
    tx: SyncSender<SessionEvent>,
    stop: StopSignal,
    interval: Duration,
) {
    loop {
        let poll = tracker.poll();
        if poll.changed && tx.send(SessionEvent::Track(poll.track)).is_err() {
            break;
        }
        if stop.wait(interval) {
            break;
        }
    }
}

fn aggregate_loop<G: PersistenceGateway>(
    mut aggregator: EmotionAggregator<G>,
    rx: Receiver<SessionEvent>,
    stop: StopSignal,
    snapshot: Arc<Mutex<SessionSnapshot>>,
) -> SessionReport {
    let mut report = SessionReport::default();
    let mut last_sample = None;

    let queued = loop {
        match rx.recv() {
            Ok(SessionEvent::Stop(cause)) => break cause,
            Ok(event) => apply(&mut aggregator, event, &mut report, &mut last_sample),
            Err(_) => break StopCause::Requested,
        }
        publish(&snapshot, aggregator.snapshot(), &last_sample, false);
    };

    // A track change that raced the stop goes first; the stop commit is last.
    while let Ok(event) = rx.try_recv() {
        if let SessionEvent::Track(_) = event {
            apply(&mut aggregator, event, &mut report, &mut last_sample);
        }
    }

    let cause = stop.requested().unwrap_or(queued);

    report.push(aggregator.commit_and_reset(cause.commit_reason()));
    report.stop_cause = Some(cause);
    publish(&snapshot, aggregator.snapshot(), &last_sample, true);
    report
}

fn apply<G: PersistenceGateway>(
    aggregator: &mut EmotionAggregator<G>,
    event: SessionEvent,
    report: &mut SessionReport,
    last_sample: &mut Option<EmotionSample>,
) {
    match event {
        SessionEvent::Sample(sample) => {
            if aggregator.record(&sample) {
                report.samples_recorded += 1;
            } else {
                report.samples_discarded += 1;
            }
            *last_sample = Some(sample);
        }
        SessionEvent::Track(Some(track)) => {
            if let Some(outcome) = aggregator.bind(track) {
                report.push(outcome);
            }
        }
        SessionEvent::Track(None) => report.push(aggregator.release()),
        SessionEvent::CommitNow => report.push(aggregator.commit_now()),
        SessionEvent::Stop(_) => {}
    }
}

fn publish(
    shared: &Mutex<SessionSnapshot>,
    view: AggregatorSnapshot,
    last_sample: &Option<EmotionSample>,
    stopped: bool,
) {
    if let Ok(mut snapshot) = shared.lock() {
        snapshot.current_track = view.current_track;
        snapshot.counts = view.counts;
        snapshot.total = view.total;
        snapshot.last_sample = last_sample.clone();
        snapshot.stopped = stopped;
    }
}

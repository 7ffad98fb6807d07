//! The Worker (§4.3): owns the three pipeline stages and the admission
//! semaphore for one remote host, pulls Segments from the shared input
//! queue while admission allows, and drains to a clean stop once the
//! queue looks exhausted.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{error, warn};

use crate::admission::Admission;
use crate::error::FleetError;
use crate::remote::RemoteAdapter;
use crate::segment::Segment;
use crate::stage::{fetch_stage, send_stage, transcode_stage, StageMsg, WorkItem};
use crate::telemetry::{TelemetryEvent, TelemetryMessage, TelemetrySender, WorkerStatus};

/// Per-host configuration resolved from the CLI (§10.1); everything the
/// Worker needs that isn't part of the shared dispatch state.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub host: String,
    pub extra_params: Vec<String>,
    pub remote_tmp: String,
    pub output_suffix: String,
    pub transcoder: String,
    pub qlimit: usize,
    pub output_dir: PathBuf,
    pub keep: bool,
}

/// What a Worker hands back to the Dispatcher once it stops, whether
/// cleanly (FINISHED) or not (BROKEN).
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub host: String,
    pub status: WorkerStatus,
    pub produced_paths: Vec<PathBuf>,
    pub processed_count: u64,
    pub retry_count: u64,
}

/// Runs one Worker to completion. Blocks the calling thread; the
/// Dispatcher is expected to call this from its own `std::thread` per
/// host (§4.4).
pub fn run(
    config: WorkerConfig,
    remote: RemoteAdapter,
    shared_tx: Sender<Segment>,
    shared_rx: Receiver<Segment>,
    telemetry_tx: Sender<TelemetryMessage>,
    running: Arc<AtomicBool>,
) -> WorkerReport {
    let telemetry = TelemetrySender::new(config.host.clone(), telemetry_tx);

    // Configuration error (§7 kind 5): detected at start-up, keeps the
    // Worker from starting at all.
    if let Err(e) = remote.probe(&config.host, &config.transcoder) {
        error!("{}", e);
        telemetry.send(TelemetryEvent::WorkerStatus(WorkerStatus::Broken));
        return WorkerReport {
            host: config.host,
            status: WorkerStatus::Broken,
            produced_paths: Vec::new(),
            processed_count: 0,
            retry_count: 0,
        };
    }

    telemetry.send(TelemetryEvent::WorkerStatus(WorkerStatus::Running));

    let (send_tx, send_rx) = unbounded();
    let (transcode_tx, transcode_rx) = unbounded();
    let (fetch_tx, fetch_rx) = unbounded();
    let (cleanup_tx, cleanup_rx) = unbounded();

    let admission = Admission::new(2);
    let produced = Arc::new(Mutex::new(Vec::new()));
    let processed_count = Arc::new(AtomicU64::new(0));
    let retry_count = Arc::new(AtomicU64::new(0));

    let send_handle = {
        let remote = remote.clone();
        let host = config.host.clone();
        let remote_tmp = config.remote_tmp.clone();
        let telemetry = telemetry.clone();
        let retry_count = retry_count.clone();
        thread::Builder::new()
            .name(format!("{}-send", config.host))
            .spawn(move || send_stage(&host, &remote, &remote_tmp, send_rx, transcode_tx, telemetry, retry_count))
            .expect("failed spawning send stage thread")
    };

    let transcode_handle = {
        let remote = remote.clone();
        let host = config.host.clone();
        let transcoder = config.transcoder.clone();
        let extra_params = config.extra_params.clone();
        let remote_tmp = config.remote_tmp.clone();
        let output_suffix = config.output_suffix.clone();
        let telemetry = telemetry.clone();
        let admission = admission.clone();
        let processed_count = processed_count.clone();
        thread::Builder::new()
            .name(format!("{}-transcode", config.host))
            .spawn(move || {
                transcode_stage(
                    &host,
                    &remote,
                    &transcoder,
                    &extra_params,
                    &remote_tmp,
                    &output_suffix,
                    transcode_rx,
                    fetch_tx,
                    telemetry,
                    admission,
                    processed_count,
                )
            })
            .expect("failed spawning transcode stage thread")
    };

    let fetch_handle = {
        let remote = remote.clone();
        let host = config.host.clone();
        let remote_tmp = config.remote_tmp.clone();
        let output_suffix = config.output_suffix.clone();
        let output_dir = config.output_dir.clone();
        let telemetry = telemetry.clone();
        let produced = produced.clone();
        thread::Builder::new()
            .name(format!("{}-fetch", config.host))
            .spawn(move || {
                fetch_stage(
                    &host,
                    &remote,
                    &remote_tmp,
                    &output_suffix,
                    &output_dir,
                    fetch_rx,
                    cleanup_tx,
                    telemetry,
                    produced,
                )
            })
            .expect("failed spawning fetch stage thread")
    };

    let mut in_flight: Option<Segment> = None;

    loop {
        if !running.load(Ordering::SeqCst) {
            break;
        }

        if admission.try_acquire() {
            match shared_rx.recv_timeout(Duration::from_secs(1)) {
                Ok(segment) => {
                    in_flight = Some(segment.clone());
                    if send_tx.send(StageMsg::Item(WorkItem::new(segment))).is_err() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    // No Segment was actually pulled, so the permit
                    // acquired above must go back (§3 invariant 3: one
                    // permit per Segment successfully pulled).
                    admission.release();
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        } else {
            thread::sleep(Duration::from_millis(100));
        }

        if should_drain(&shared_rx, config.qlimit) {
            break;
        }
    }

    telemetry.send(TelemetryEvent::WorkerStatus(WorkerStatus::Draining));
    let _ = send_tx.send(StageMsg::Sentinel);

    let send_result = send_handle.join().expect("send stage thread panicked");
    let transcode_result = transcode_handle.join().expect("transcode stage thread panicked");
    let fetch_result = fetch_handle.join().expect("fetch stage thread panicked");

    if let Err(e) = send_result.and(transcode_result).and(fetch_result) {
        // Fatal stage failure (§7 kind 3): break the Worker and re-queue
        // the Segment that was in flight when the failure was detected,
        // regardless of which stage it was in (see DESIGN.md).
        error!("{}", e);
        telemetry.send(TelemetryEvent::WorkerStatus(WorkerStatus::Broken));
        if let Some(segment) = in_flight.take() {
            let _ = shared_tx.send(segment);
        }
        return WorkerReport {
            host: config.host,
            status: WorkerStatus::Broken,
            produced_paths: produced.lock().expect("produced mutex poisoned").clone(),
            processed_count: processed_count.load(Ordering::Relaxed),
            retry_count: retry_count.load(Ordering::Relaxed),
        };
    }

    cleanup(&config, &remote, &cleanup_rx);

    telemetry.send(TelemetryEvent::WorkerStatus(WorkerStatus::Finished));
    WorkerReport {
        host: config.host,
        status: WorkerStatus::Finished,
        produced_paths: produced.lock().expect("produced mutex poisoned").clone(),
        processed_count: processed_count.load(Ordering::Relaxed),
        retry_count: retry_count.load(Ordering::Relaxed),
    }
}

/// Whether the shared queue looks exhausted enough for this Worker to
/// stop pulling and move into draining (§4.3 intake loop, §9). True once
/// the queue is empty or has fallen below `qlimit`, signalling the other
/// Workers are keeping up without this one.
fn should_drain(shared_rx: &Receiver<Segment>, qlimit: usize) -> bool {
    shared_rx.is_empty() || shared_rx.len() < qlimit
}

/// Drains the cleanup collector and issues a single batched `rm -f` for
/// every remote output it names (§4.3 step 4, §7 kind 4). Errors here are
/// logged, never fatal, and the Open Questions decision in DESIGN.md is
/// what makes the `rm -f` verb explicit rather than assumed.
fn cleanup(config: &WorkerConfig, remote: &RemoteAdapter, cleanup_rx: &Receiver<StageMsg>) {
    if config.keep {
        return;
    }

    let mut basenames = Vec::new();
    while let Ok(msg) = cleanup_rx.try_recv() {
        if let StageMsg::Item(item) = msg {
            basenames.push(item.basename);
        }
    }
    if basenames.is_empty() {
        return;
    }

    let mut argv = vec!["rm".to_string(), "-f".to_string()];
    argv.extend(basenames.iter().map(|basename| {
        format!("{}/{}.{}", config.remote_tmp, basename, config.output_suffix)
    }));
    argv.extend(
        basenames
            .iter()
            .map(|basename| format!("{}/{}", config.remote_tmp, basename)),
    );

    let outcome = remote.remote_exec(&config.host, &argv, |_| {});
    let failure = match outcome {
        Ok(code) if code == 0 => None,
        Ok(code) => Some(FleetError::CleanupFailure {
            host: config.host.clone(),
            reason: format!("rm -f exited {}", code),
        }),
        Err(e) => Some(FleetError::CleanupFailure {
            host: config.host.clone(),
            reason: e.to_string(),
        }),
    };
    if let Some(failure) = failure {
        warn!("{}", failure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Segment;
    use crossbeam::channel::unbounded;

    fn segment(n: u32) -> Segment {
        PathBuf::from(format!("/tmp/chunks/segment_{:05}.mp4", n))
    }

    #[test]
    fn does_not_drain_while_queue_still_meets_qlimit() {
        let (tx, rx) = unbounded();
        tx.send(segment(0)).unwrap();
        tx.send(segment(1)).unwrap();
        assert!(!should_drain(&rx, 2));
    }

    #[test]
    fn drains_once_queue_falls_below_qlimit() {
        let (tx, rx) = unbounded();
        tx.send(segment(0)).unwrap();
        assert!(should_drain(&rx, 2));
    }

    #[test]
    fn drains_on_an_empty_queue_even_with_qlimit_zero() {
        let (_tx, rx) = unbounded::<Segment>();
        assert!(should_drain(&rx, 0));
    }

    #[test]
    fn timeout_on_an_empty_queue_releases_the_permit_it_acquired() {
        // Mirrors the intake loop's Timeout arm directly: the permit must
        // go back so a transiently empty queue never leaks admission.
        let admission = Admission::new(1);
        let (_tx, rx) = unbounded::<Segment>();

        assert!(admission.try_acquire());
        match rx.recv_timeout(Duration::from_millis(50)) {
            Err(RecvTimeoutError::Timeout) => admission.release(),
            other => panic!("expected a timeout on an empty queue, got {:?}", other),
        }

        assert!(admission.try_acquire(), "the permit must be available again");
    }
}

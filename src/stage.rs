//! Pipeline Stage (§4.2): the send, transcode and fetch stages every
//! Worker runs as three independent threads. All three share the loop
//! shape from the teacher's `host_thread`/`encoder_thread`: pop from an
//! input channel, forward a sentinel and exit on the terminal item,
//! otherwise perform the stage action and push downstream on success.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crossbeam::channel::{Receiver, Sender};

use crate::admission::Admission;
use crate::error::{FleetError, Result};
use crate::remote::{parse_transcode_progress, RemoteAdapter};
use crate::telemetry::{StageKind, StageStatus, TelemetryEvent, TelemetrySender};

/// One segment in flight inside a Worker: its local path plus the short
/// identifier that names both the uploaded input and the produced output
/// on the remote host (§3).
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub segment: PathBuf,
    pub basename: String,
}

impl WorkItem {
    pub fn new(segment: PathBuf) -> Self {
        let basename = crate::segment::basename(&segment);
        WorkItem { segment, basename }
    }
}

/// A stage channel carries either a live item or the terminal sentinel
/// (§3 invariant 4).
#[derive(Debug, Clone)]
pub enum StageMsg {
    Item(WorkItem),
    Sentinel,
}

fn disconnected(host: &str, stage: &str) -> FleetError {
    FleetError::FatalWorkerFailure {
        host: host.to_string(),
        reason: format!("{} stage's input channel disconnected unexpectedly", stage),
    }
}

/// Uploads a Segment's file to `<remote_tmp>/<basename>` on `host`,
/// retrying a failed copy up to three times before raising a fatal error
/// (§4.2.1, §7 kind 1).
pub fn send_stage(
    host: &str,
    remote: &RemoteAdapter,
    remote_tmp: &str,
    input: Receiver<StageMsg>,
    output: Sender<StageMsg>,
    telemetry: TelemetrySender,
    retry_count: Arc<AtomicU64>,
) -> Result<()> {
    telemetry.send(TelemetryEvent::StageStatus {
        stage: StageKind::Send,
        status: StageStatus::Idle,
    });
    loop {
        match input.recv().map_err(|_| disconnected(host, "send"))? {
            StageMsg::Sentinel => {
                telemetry.send(TelemetryEvent::StageStatus {
                    stage: StageKind::Send,
                    status: StageStatus::Finished,
                });
                let _ = output.send(StageMsg::Sentinel);
                return Ok(());
            }
            StageMsg::Item(item) => {
                telemetry.send(TelemetryEvent::StageStatus {
                    stage: StageKind::Send,
                    status: StageStatus::Active(item.basename.clone()),
                });

                let source = item.segment.to_string_lossy().into_owned();
                let destination = format!("{}:{}/{}", host, remote_tmp, item.basename);

                let mut retries = 0u32;
                loop {
                    let progress_telemetry = telemetry.clone();
                    let exit = remote.remote_copy(&source, &destination, |percent, eta| {
                        progress_telemetry.send(TelemetryEvent::CopyProgress { percent, eta });
                    })?;
                    if exit == 0 {
                        break;
                    }

                    let failure = FleetError::TransientCopyFailure {
                        source: source.clone(),
                        destination: destination.clone(),
                        exit_code: Some(exit),
                    };
                    if !failure.is_transient() || retries >= 3 {
                        return Err(FleetError::FatalWorkerFailure {
                            host: host.to_string(),
                            reason: format!(
                                "upload of {} failed after {} retries: {}",
                                item.basename, retries, failure
                            ),
                        });
                    }
                    retries += 1;
                    retry_count.fetch_add(1, Ordering::Relaxed);
                    telemetry.send(TelemetryEvent::Retry);
                }

                output
                    .send(StageMsg::Item(item))
                    .map_err(|_| disconnected(host, "transcode"))?;
            }
        }
    }
}

/// Invokes the remote transcoder on the uploaded input, parsing stderr
/// records for fps/time progress, releasing one admission permit on
/// success (§4.2.2, §7 kind 2: never retried).
#[allow(clippy::too_many_arguments)]
pub fn transcode_stage(
    host: &str,
    remote: &RemoteAdapter,
    transcoder: &str,
    extra_params: &[String],
    remote_tmp: &str,
    output_suffix: &str,
    input: Receiver<StageMsg>,
    output: Sender<StageMsg>,
    telemetry: TelemetrySender,
    admission: Admission,
    processed_count: Arc<AtomicU64>,
) -> Result<()> {
    telemetry.send(TelemetryEvent::StageStatus {
        stage: StageKind::Transcode,
        status: StageStatus::Idle,
    });
    loop {
        match input.recv().map_err(|_| disconnected(host, "transcode"))? {
            StageMsg::Sentinel => {
                telemetry.send(TelemetryEvent::StageStatus {
                    stage: StageKind::Transcode,
                    status: StageStatus::Finished,
                });
                let _ = output.send(StageMsg::Sentinel);
                return Ok(());
            }
            StageMsg::Item(item) => {
                telemetry.send(TelemetryEvent::StageStatus {
                    stage: StageKind::Transcode,
                    status: StageStatus::Active(item.basename.clone()),
                });

                let remote_in = format!("{}/{}", remote_tmp, item.basename);
                let remote_out = format!("{}.{}", remote_in, output_suffix);

                let mut argv = vec![
                    transcoder.to_string(),
                    "-stats".to_string(),
                    "-y".to_string(),
                    "-i".to_string(),
                    remote_in,
                ];
                argv.extend(extra_params.iter().cloned());
                argv.push(remote_out);

                let progress_telemetry = telemetry.clone();
                let exit = remote.remote_exec(host, &argv, |record| {
                    if let Some((fps, time_code)) = parse_transcode_progress(record) {
                        progress_telemetry.send(TelemetryEvent::TranscodeProgress {
                            fps,
                            time_code,
                            at: Instant::now(),
                        });
                    }
                })?;
                if exit != 0 {
                    // Never retried (§7 kind 2): a bad segment keeps
                    // failing the same way, so this is promoted straight
                    // to a fatal worker failure.
                    let failure = FleetError::FatalTranscodeFailure {
                        host: host.to_string(),
                        item: item.basename.clone(),
                        exit_code: Some(exit),
                    };
                    return Err(FleetError::FatalWorkerFailure {
                        host: host.to_string(),
                        reason: failure.to_string(),
                    });
                }

                processed_count.fetch_add(1, Ordering::Relaxed);
                telemetry.send(TelemetryEvent::Processed);
                admission.release();

                output
                    .send(StageMsg::Item(item))
                    .map_err(|_| disconnected(host, "fetch"))?;
            }
        }
    }
}

/// Downloads the produced output beside the uploaded input, appends it
/// to `produced`, and forwards the item to the cleanup collector
/// (§4.2.3).
#[allow(clippy::too_many_arguments)]
pub fn fetch_stage(
    host: &str,
    remote: &RemoteAdapter,
    remote_tmp: &str,
    output_suffix: &str,
    output_dir: &Path,
    input: Receiver<StageMsg>,
    cleanup: Sender<StageMsg>,
    telemetry: TelemetrySender,
    produced: Arc<Mutex<Vec<PathBuf>>>,
) -> Result<()> {
    telemetry.send(TelemetryEvent::StageStatus {
        stage: StageKind::Fetch,
        status: StageStatus::Idle,
    });
    loop {
        match input.recv().map_err(|_| disconnected(host, "fetch"))? {
            StageMsg::Sentinel => {
                telemetry.send(TelemetryEvent::StageStatus {
                    stage: StageKind::Fetch,
                    status: StageStatus::Finished,
                });
                let _ = cleanup.send(StageMsg::Sentinel);
                return Ok(());
            }
            StageMsg::Item(item) => {
                telemetry.send(TelemetryEvent::StageStatus {
                    stage: StageKind::Fetch,
                    status: StageStatus::Active(item.basename.clone()),
                });

                let remote_path =
                    format!("{}:{}/{}.{}", host, remote_tmp, item.basename, output_suffix);
                let mut local_path = output_dir.to_path_buf();
                local_path.push(format!("{}.{}", item.basename, output_suffix));
                let destination = local_path.to_string_lossy().into_owned();

                let progress_telemetry = telemetry.clone();
                let exit = remote.remote_copy(&remote_path, &destination, |percent, eta| {
                    progress_telemetry.send(TelemetryEvent::CopyProgress { percent, eta });
                })?;
                if exit != 0 {
                    return Err(FleetError::FatalWorkerFailure {
                        host: host.to_string(),
                        reason: format!(
                            "download of {} failed (exit {})",
                            item.basename, exit
                        ),
                    });
                }

                produced
                    .lock()
                    .expect("produced paths mutex poisoned")
                    .push(local_path.clone());
                telemetry.send(TelemetryEvent::Produced(local_path));

                cleanup
                    .send(StageMsg::Item(item))
                    .map_err(|_| disconnected(host, "cleanup"))?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::TelemetryEvent as Ev;
    use crossbeam::channel::unbounded;

    fn test_telemetry() -> (TelemetrySender, crossbeam::channel::Receiver<(String, Ev)>) {
        let (tx, rx) = crate::telemetry::channel();
        (TelemetrySender::new("host1", tx), rx)
    }

    #[test]
    fn sentinel_propagates_exactly_once_and_stage_finishes() {
        let (in_tx, in_rx) = unbounded();
        let (out_tx, out_rx) = unbounded();
        let (telemetry, _rx) = test_telemetry();
        in_tx.send(StageMsg::Sentinel).unwrap();

        let remote = RemoteAdapter::new("ssh", "scp", Default::default());
        let retry_count = Arc::new(AtomicU64::new(0));
        let result = send_stage("host1", &remote, "/tmp", in_rx, out_tx, telemetry, retry_count);
        assert!(result.is_ok());

        match out_rx.try_recv().unwrap() {
            StageMsg::Sentinel => {}
            _ => panic!("expected sentinel forwarded downstream"),
        }
        assert!(out_rx.try_recv().is_err(), "only one sentinel should be forwarded");
    }

    #[test]
    fn work_item_basename_matches_segment_filename() {
        let item = WorkItem::new(PathBuf::from("/tmp/chunks/output0002.mp4"));
        assert_eq!(item.basename, "output0002.mp4");
    }

    /// Writes a fake `scp` that counts its own invocations in
    /// `counter_path` and exits non-zero until `succeed_on`, then exits 0
    /// from then on. Lets the retry loop in `send_stage` be driven without
    /// a real remote host.
    fn scripted_scp(dir: &std::path::Path, succeed_on: u32) -> PathBuf {
        let counter_path = dir.join("counter");
        let script_path = dir.join("fake-scp");
        let script = format!(
            "#!/bin/sh\ncount=$(cat '{counter}' 2>/dev/null || echo 0)\ncount=$((count + 1))\necho \"$count\" > '{counter}'\nif [ \"$count\" -ge {succeed_on} ]; then exit 0; else exit 1; fi\n",
            counter = counter_path.display(),
            succeed_on = succeed_on,
        );
        std::fs::write(&script_path, script).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&script_path, perms).unwrap();
        }
        script_path
    }

    #[test]
    fn send_stage_retries_then_succeeds_once_the_copy_starts_working() {
        let dir = tempfile::tempdir().unwrap();
        let scp = scripted_scp(dir.path(), 3);

        let (in_tx, in_rx) = unbounded();
        let (out_tx, out_rx) = unbounded();
        let (telemetry, _rx) = test_telemetry();
        let item = WorkItem::new(PathBuf::from("/tmp/chunks/segment_00000.mp4"));
        in_tx.send(StageMsg::Item(item)).unwrap();
        in_tx.send(StageMsg::Sentinel).unwrap();

        let remote = RemoteAdapter::new("ssh", scp.to_str().unwrap(), Default::default());
        let retry_count = Arc::new(AtomicU64::new(0));
        let result = send_stage("host1", &remote, "/tmp", in_rx, out_tx, telemetry, retry_count.clone());

        assert!(result.is_ok());
        assert_eq!(retry_count.load(Ordering::Relaxed), 2);
        match out_rx.try_recv().unwrap() {
            StageMsg::Item(item) => assert_eq!(item.basename, "segment_00000.mp4"),
            StageMsg::Sentinel => panic!("expected the item before the sentinel"),
        }
        assert!(matches!(out_rx.try_recv().unwrap(), StageMsg::Sentinel));
    }

    #[test]
    fn send_stage_gives_up_after_three_retries() {
        let dir = tempfile::tempdir().unwrap();
        // Never reaches "success": succeed_on is unreachable within 4 tries.
        let scp = scripted_scp(dir.path(), 100);

        let (in_tx, in_rx) = unbounded();
        let (out_tx, out_rx) = unbounded();
        let (telemetry, _rx) = test_telemetry();
        let item = WorkItem::new(PathBuf::from("/tmp/chunks/segment_00001.mp4"));
        in_tx.send(StageMsg::Item(item)).unwrap();
        in_tx.send(StageMsg::Sentinel).unwrap();

        let remote = RemoteAdapter::new("ssh", scp.to_str().unwrap(), Default::default());
        let retry_count = Arc::new(AtomicU64::new(0));
        let result = send_stage("host1", &remote, "/tmp", in_rx, out_tx, telemetry, retry_count.clone());

        assert!(result.is_err());
        assert_eq!(retry_count.load(Ordering::Relaxed), 3);
        assert!(out_rx.try_recv().is_err(), "a failed item is never forwarded downstream");
    }
}

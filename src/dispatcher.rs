//! The Dispatcher (§4.4): owns the shared input queue and the telemetry
//! channel, spawns one Worker thread per host plus the Status Reporter,
//! and folds every Worker's report into one ordered result.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;

use crossbeam::channel::unbounded;
use log::{info, warn};

use crate::remote::RemoteAdapter;
use crate::segment::Segment;
use crate::status;
use crate::telemetry;
use crate::worker::{self, WorkerConfig, WorkerReport};

/// Everything the Dispatcher needs to build a [`WorkerConfig`] per host;
/// the parts of the CLI configuration that don't vary by host.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub extra_params: Vec<String>,
    pub remote_tmp: String,
    pub output_suffix: String,
    pub transcoder: String,
    pub qlimit: usize,
    pub output_dir: PathBuf,
    pub keep: bool,
}

/// What a full dispatch run produced: the sorted output paths, enough of
/// each Worker's final status to decide the process exit code (§6.4),
/// and which originally-discovered segments never made it into
/// `produced_paths` at all (§3 invariant 1, §6.4).
#[derive(Debug)]
pub struct DispatchReport {
    pub produced_paths: Vec<PathBuf>,
    pub worker_reports: Vec<WorkerReport>,
    pub missing_segments: Vec<String>,
}

impl DispatchReport {
    pub fn any_broken(&self) -> bool {
        self.worker_reports
            .iter()
            .any(|r| r.status == crate::telemetry::WorkerStatus::Broken)
    }

    pub fn all_broken(&self) -> bool {
        !self.worker_reports.is_empty()
            && self
                .worker_reports
                .iter()
                .all(|r| r.status == crate::telemetry::WorkerStatus::Broken)
    }

    /// Whether every originally-discovered segment is accounted for in
    /// `produced_paths`. False means a re-queued Segment (§4.3 fatal
    /// stage failure policy) was never picked back up before every
    /// Worker finished or broke — a silently incomplete output.
    pub fn is_complete(&self) -> bool {
        self.missing_segments.is_empty()
    }
}

/// Recovers the segment basename a produced path was made from by
/// stripping the trailing `.<output_suffix>` the fetch stage appended.
fn produced_basename(path: &std::path::Path, output_suffix: &str) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    name.strip_suffix(&format!(".{}", output_suffix))
        .map(str::to_string)
}

/// Diffs the segments originally discovered against what actually ended
/// up in `produced_paths`, returning any basenames unaccounted for.
fn find_missing_segments(
    expected: &[String],
    produced_paths: &[PathBuf],
    output_suffix: &str,
) -> Vec<String> {
    let produced: std::collections::HashSet<String> = produced_paths
        .iter()
        .filter_map(|path| produced_basename(path, output_suffix))
        .collect();
    expected
        .iter()
        .filter(|basename| !produced.contains(*basename))
        .cloned()
        .collect()
}

/// Fills the shared queue with every Segment, spawns one Worker per
/// host alongside the Status Reporter, and blocks until all of them are
/// done (§4.4, §4.5).
pub fn run(
    hosts: &[String],
    segments: Vec<Segment>,
    config: &DispatcherConfig,
    remote: &RemoteAdapter,
    running: Arc<AtomicBool>,
) -> DispatchReport {
    let (shared_tx, shared_rx) = unbounded();
    let expected_basenames: Vec<String> = segments.iter().map(crate::segment::basename).collect();
    let segment_count = segments.len();
    for segment in segments {
        shared_tx.send(segment).expect("shared queue receiver dropped before fill");
    }
    info!("queued {} segments across {} hosts", segment_count, hosts.len());

    let (telemetry_tx, telemetry_rx) = telemetry::channel();

    let handles: Vec<_> = hosts
        .iter()
        .map(|host| {
            let worker_config = WorkerConfig {
                host: host.clone(),
                extra_params: config.extra_params.clone(),
                remote_tmp: config.remote_tmp.clone(),
                output_suffix: config.output_suffix.clone(),
                transcoder: config.transcoder.clone(),
                qlimit: config.qlimit,
                output_dir: config.output_dir.clone(),
                keep: config.keep,
            };
            let remote = remote.clone();
            let shared_tx = shared_tx.clone();
            let shared_rx = shared_rx.clone();
            let telemetry_tx = telemetry_tx.clone();
            let running = running.clone();
            thread::Builder::new()
                .name(format!("worker-{}", host))
                .spawn(move || worker::run(worker_config, remote, shared_tx, shared_rx, telemetry_tx, running))
                .expect("failed spawning worker thread")
        })
        .collect();

    // The Dispatcher's own handles are dropped now; each Worker (and its
    // stage threads) holds the clones that keep the queue and telemetry
    // channel alive until every one of them finishes.
    drop(shared_tx);
    drop(telemetry_tx);

    let reporter_hosts = hosts.to_vec();
    let reporter_handle = thread::Builder::new()
        .name("status-reporter".to_string())
        .spawn(move || status::run(&reporter_hosts, telemetry_rx))
        .expect("failed spawning status reporter thread");

    let worker_reports: Vec<WorkerReport> = handles
        .into_iter()
        .map(|handle| handle.join().expect("worker thread panicked"))
        .collect();

    let _ = reporter_handle.join();

    let mut produced_paths: Vec<PathBuf> = worker_reports
        .iter()
        .flat_map(|r| r.produced_paths.clone())
        .collect();
    produced_paths.sort();

    let missing_segments =
        find_missing_segments(&expected_basenames, &produced_paths, &config.output_suffix);
    if !missing_segments.is_empty() {
        warn!(
            "{} of {} segments never produced an output: {:?}",
            missing_segments.len(),
            segment_count,
            missing_segments
        );
    }

    DispatchReport {
        produced_paths,
        worker_reports,
        missing_segments,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_broken_and_all_broken_reflect_worker_statuses() {
        use crate::telemetry::WorkerStatus;

        let mixed = DispatchReport {
            produced_paths: Vec::new(),
            worker_reports: vec![
                WorkerReport {
                    host: "a".into(),
                    status: WorkerStatus::Finished,
                    produced_paths: Vec::new(),
                    processed_count: 1,
                    retry_count: 0,
                },
                WorkerReport {
                    host: "b".into(),
                    status: WorkerStatus::Broken,
                    produced_paths: Vec::new(),
                    processed_count: 0,
                    retry_count: 0,
                },
            ],
            missing_segments: Vec::new(),
        };
        assert!(mixed.any_broken());
        assert!(!mixed.all_broken());

        let all_broken = DispatchReport {
            produced_paths: Vec::new(),
            worker_reports: vec![WorkerReport {
                host: "a".into(),
                status: WorkerStatus::Broken,
                produced_paths: Vec::new(),
                processed_count: 0,
                retry_count: 0,
            }],
            missing_segments: Vec::new(),
        };
        assert!(all_broken.all_broken());

        let empty = DispatchReport {
            produced_paths: Vec::new(),
            worker_reports: Vec::new(),
            missing_segments: Vec::new(),
        };
        assert!(!empty.all_broken());
    }

    #[test]
    fn produced_paths_end_up_sorted_across_workers() {
        let worker_reports = vec![
            WorkerReport {
                host: "b".into(),
                status: WorkerStatus::Finished,
                produced_paths: vec![
                    PathBuf::from("/out/segment_00003.ts"),
                    PathBuf::from("/out/segment_00001.ts"),
                ],
                processed_count: 2,
                retry_count: 0,
            },
            WorkerReport {
                host: "a".into(),
                status: WorkerStatus::Finished,
                produced_paths: vec![
                    PathBuf::from("/out/segment_00000.ts"),
                    PathBuf::from("/out/segment_00002.ts"),
                ],
                processed_count: 2,
                retry_count: 0,
            },
        ];

        let mut produced_paths: Vec<PathBuf> = worker_reports
            .iter()
            .flat_map(|r| r.produced_paths.clone())
            .collect();
        produced_paths.sort();

        assert_eq!(
            produced_paths,
            vec![
                PathBuf::from("/out/segment_00000.ts"),
                PathBuf::from("/out/segment_00001.ts"),
                PathBuf::from("/out/segment_00002.ts"),
                PathBuf::from("/out/segment_00003.ts"),
            ]
        );
    }

    #[test]
    fn find_missing_segments_reports_unaccounted_for_basenames() {
        let expected = vec![
            "segment_00000.mp4".to_string(),
            "segment_00001.mp4".to_string(),
            "segment_00002.mp4".to_string(),
        ];
        let produced_paths = vec![
            PathBuf::from("/out/segment_00000.mp4.ts"),
            PathBuf::from("/out/segment_00002.mp4.ts"),
        ];

        let missing = find_missing_segments(&expected, &produced_paths, "ts");
        assert_eq!(missing, vec!["segment_00001.mp4".to_string()]);
    }

    #[test]
    fn find_missing_segments_is_empty_when_every_segment_was_produced() {
        let expected = vec!["segment_00000.mp4".to_string(), "segment_00001.mp4".to_string()];
        let produced_paths = vec![
            PathBuf::from("/out/segment_00001.mp4.ts"),
            PathBuf::from("/out/segment_00000.mp4.ts"),
        ];

        let missing = find_missing_segments(&expected, &produced_paths, "ts");
        assert!(missing.is_empty());
        assert!(DispatchReport {
            produced_paths,
            worker_reports: Vec::new(),
            missing_segments: missing,
        }
        .is_complete());
    }
}

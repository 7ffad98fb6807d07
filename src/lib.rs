//! A distributed video transcoder that splits a file into segments and
//! fans them out across a fleet of remote hosts, each running its own
//! upload / transcode / download pipeline, in parallel (§1, §2).

use std::{
    fs,
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
};

use log::{info, warn};

mod admission;
pub mod config;
mod dispatcher;
pub mod error;
mod local;
mod remote;
mod segment;
mod stage;
mod status;
mod telemetry;
mod worker;

pub use config::{CliArgs, Config};
pub use error::{FleetError, Result};

use dispatcher::DispatcherConfig;
use remote::RemoteAdapter;
use telemetry::WorkerStatus;

/// Starts the whole operation and cleans up afterwards (§2, §4).
pub fn run(args: CliArgs) -> Result<()> {
    let config = Config::from_args(args)?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
        info!(
            "abort signal received, waiting for in-flight segments to finish and quitting gracefully"
        );
    })
    .expect("error setting Ctrl-C handler");

    fs::create_dir_all(&config.tmp_dir)?;
    let mut chunk_dir = config.tmp_dir.clone();
    chunk_dir.push("chunks");
    fs::create_dir_all(&chunk_dir)?;
    let mut output_dir = config.tmp_dir.clone();
    output_dir.push("produced");
    fs::create_dir_all(&output_dir)?;

    let result = run_dispatch(&config, &chunk_dir, &output_dir, running.clone());

    if !config.keep {
        info!("cleaning up local temporary directory");
        fs::remove_dir_all(&config.tmp_dir).ok();
    }

    result
}

fn run_dispatch(
    config: &Config,
    chunk_dir: &std::path::Path,
    output_dir: &std::path::Path,
    running: Arc<AtomicBool>,
) -> Result<()> {
    info!("splitting {} into segments", config.input.display());
    local::split_video(&config.input, chunk_dir, config.segment_length)?;

    if !running.load(Ordering::SeqCst) {
        return Ok(());
    }

    let segments = segment::discover(chunk_dir)?;
    if segments.is_empty() {
        return Err(FleetError::ConfigurationError(
            "splitting produced no segments".to_string(),
        ));
    }
    info!("discovered {} segments", segments.len());

    let remote = RemoteAdapter::new(
        config.ssh_bin.clone(),
        config.scp_bin.clone(),
        config.keepalive.clone(),
    );

    let dispatcher_config = DispatcherConfig {
        extra_params: config.transcoder_args.clone(),
        remote_tmp: config.remote_tmp.clone(),
        output_suffix: config.output_suffix.clone(),
        transcoder: config.transcoder.clone(),
        qlimit: config.qlimit,
        output_dir: output_dir.to_path_buf(),
        keep: config.keep,
    };

    let report = dispatcher::run(&config.hosts, segments, &dispatcher_config, &remote, running.clone());

    if report.any_broken() {
        for worker_report in &report.worker_reports {
            if worker_report.status == WorkerStatus::Broken {
                warn!("worker for {} broke before finishing", worker_report.host);
            }
        }
    }
    if report.all_broken() {
        return Err(FleetError::FatalWorkerFailure {
            host: "all hosts".to_string(),
            reason: "every worker broke before producing any output".to_string(),
        });
    }

    if !running.load(Ordering::SeqCst) {
        return Ok(());
    }

    // A re-queued Segment can outlive every Worker if they all finish or
    // break before anyone picks it back up (§3 invariant 1, §6.4); that
    // must fail loudly rather than concatenate a silently incomplete set.
    if !report.is_complete() {
        return Err(FleetError::IncompleteOutput {
            missing: report.missing_segments.clone(),
        });
    }

    info!("concatenating {} produced segments", report.produced_paths.len());
    local::concatenate(&report.produced_paths, &config.tmp_dir, &config.output)?;

    Ok(())
}

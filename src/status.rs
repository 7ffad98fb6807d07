//! The Status Reporter (§4.5, §6.3): renders a human-readable line per
//! Worker plus an aggregate fps line, roughly once a second, by folding
//! the telemetry channel into a small per-host view.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError};

use crate::telemetry::{StageKind, StageStatus, TelemetryEvent, TelemetryMessage, WorkerStatus};

const REPORT_INTERVAL: Duration = Duration::from_secs(1);
const STALE_THRESHOLD: Duration = Duration::from_secs(30);
const ROLLING_WINDOW: usize = 100;

#[derive(Debug, Clone)]
struct WorkerView {
    status: WorkerStatus,
    send: StageStatus,
    transcode: StageStatus,
    fetch: StageStatus,
    fps: f64,
    time_code: String,
    last_contact: Option<Instant>,
    processed_count: u64,
    retry_count: u64,
}

impl Default for WorkerView {
    fn default() -> Self {
        WorkerView {
            status: WorkerStatus::Idle,
            send: StageStatus::Idle,
            transcode: StageStatus::Idle,
            fetch: StageStatus::Idle,
            fps: 0.0,
            time_code: String::new(),
            last_contact: None,
            processed_count: 0,
            retry_count: 0,
        }
    }
}

impl WorkerView {
    fn stale(&self) -> bool {
        matches!(self.transcode, StageStatus::Active(_))
            && self
                .last_contact
                .map(|at| at.elapsed() > STALE_THRESHOLD)
                .unwrap_or(false)
    }

    fn apply(&mut self, event: TelemetryEvent) {
        match event {
            TelemetryEvent::WorkerStatus(status) => self.status = status,
            TelemetryEvent::StageStatus { stage, status } => match stage {
                StageKind::Send => self.send = status,
                StageKind::Transcode => self.transcode = status,
                StageKind::Fetch => self.fetch = status,
            },
            TelemetryEvent::TranscodeProgress { fps, time_code, at } => {
                self.fps = fps;
                self.time_code = time_code;
                self.last_contact = Some(at);
            }
            TelemetryEvent::CopyProgress { .. } => {}
            TelemetryEvent::Processed => self.processed_count += 1,
            TelemetryEvent::Retry => self.retry_count += 1,
            TelemetryEvent::Produced(_) => {}
        }
    }

    fn fps_for_aggregate(&self) -> f64 {
        if matches!(self.transcode, StageStatus::Active(_)) {
            self.fps
        } else {
            0.0
        }
    }

    /// Renders one line in the documented shape:
    /// `host1  [p03]: ST: RUNNING | SENDER(SENDING, 1, ->clip0007.mp4) -> ...`
    fn render(&self, host: &str, queue_depths: (usize, usize, usize)) -> String {
        format!(
            "{}\t[p{:02}]: ST: {} | {} -> {} -> {} | stale: {} | fps: {} time: {}",
            host,
            self.processed_count,
            self.status.as_str(),
            stage_repr("SENDER", &self.send, StageKind::Send, queue_depths.0, "->"),
            stage_repr("COMPRESS", &self.transcode, StageKind::Transcode, queue_depths.1, "*"),
            stage_repr("DOWNLOAD", &self.fetch, StageKind::Fetch, queue_depths.2, "<-"),
            self.stale(),
            self.fps_for_aggregate(),
            self.time_code,
        )
    }
}

fn stage_repr(label: &str, status: &StageStatus, kind: StageKind, queue_depth: usize, arrow: &str) -> String {
    match status.filename() {
        Some(name) => format!("{}({}, {}, {}{})", label, status.label(kind), queue_depth, arrow, name),
        None => format!("{}({}, {})", label, status.label(kind), queue_depth),
    }
}

/// Consumes the telemetry channel until every known host reaches
/// FINISHED or BROKEN, printing a full snapshot roughly once a second.
pub fn run(hosts: &[String], telemetry_rx: Receiver<TelemetryMessage>) {
    let mut views: HashMap<String, WorkerView> = hosts
        .iter()
        .map(|host| (host.clone(), WorkerView::default()))
        .collect();
    let mut history: VecDeque<f64> = VecDeque::with_capacity(ROLLING_WINDOW);
    let mut last_report = Instant::now();

    loop {
        match telemetry_rx.recv_timeout(Duration::from_millis(200)) {
            Ok((host, event)) => {
                views.entry(host).or_default().apply(event);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                print_report(hosts, &views, &mut history);
                return;
            }
        }

        if last_report.elapsed() >= REPORT_INTERVAL {
            print_report(hosts, &views, &mut history);
            last_report = Instant::now();
        }

        if views.values().all(|v| {
            matches!(v.status, WorkerStatus::Finished | WorkerStatus::Broken)
        }) {
            return;
        }
    }
}

fn print_report(hosts: &[String], views: &HashMap<String, WorkerView>, history: &mut VecDeque<f64>) {
    let mut curr = 0.0;
    for host in hosts {
        if let Some(view) = views.get(host) {
            println!("{}", view.render(host, (0, 0, 0)));
            curr += view.fps_for_aggregate();
        }
    }
    history.push_back(curr);
    if history.len() > ROLLING_WINDOW {
        history.pop_front();
    }
    let avg = history.iter().sum::<f64>() / history.len() as f64;
    println!("AVG: {:.2} fps | CURR: {:.2} fps\n", avg, curr);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_flag_only_set_while_transcoding_and_quiet() {
        let mut view = WorkerView::default();
        assert!(!view.stale());
        view.transcode = StageStatus::Active("clip0001.mp4".to_string());
        view.last_contact = Some(Instant::now() - Duration::from_secs(31));
        assert!(view.stale());
        view.last_contact = Some(Instant::now());
        assert!(!view.stale());
    }

    #[test]
    fn fps_only_reported_while_transcoding() {
        let mut view = WorkerView::default();
        view.fps = 42.0;
        assert_eq!(view.fps_for_aggregate(), 0.0);
        view.transcode = StageStatus::Active("clip0001.mp4".to_string());
        assert_eq!(view.fps_for_aggregate(), 42.0);
    }

    #[test]
    fn rolling_history_caps_at_window() {
        let mut history = VecDeque::with_capacity(ROLLING_WINDOW);
        for i in 0..150 {
            history.push_back(i as f64);
            if history.len() > ROLLING_WINDOW {
                history.pop_front();
            }
        }
        assert_eq!(history.len(), ROLLING_WINDOW);
        assert_eq!(*history.front().unwrap(), 50.0);
    }
}

//! The Remote Exec / Copy Adapter: runs a command on a remote host and
//! copies a file to/from one, shelling out to the user's own `ssh`/`scp`
//! clients so their existing keys, agent and `~/.ssh/config` keep working.

use std::io::Read;
use std::process::{Command, Stdio};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{FleetError, Result};

/// `N% ... HH:MM:SS ETA`, the progress line `scp` emits per chunk.
static COPY_PROGRESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)%.*?(\d{1,2}:\d{2}:\d{2}) ETA").unwrap());

/// `fps=<number>.*?time=<timecode>`, the progress line the remote
/// transcoder writes to stderr while it runs.
static TRANSCODE_PROGRESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"fps=\s*([0-9.]+).*?(time=[0-9:.]+)").unwrap());

/// Connection/keepalive tuning applied to every `ssh`/`scp` invocation so a
/// hung remote end is detected in tens of seconds rather than indefinitely.
#[derive(Debug, Clone)]
pub struct Keepalive {
    pub interval_secs: u32,
    pub count_max: u32,
}

impl Default for Keepalive {
    fn default() -> Self {
        Keepalive {
            interval_secs: 10,
            count_max: 3,
        }
    }
}

/// Shells out to local `ssh`/`scp` binaries to talk to remote hosts.
#[derive(Debug, Clone)]
pub struct RemoteAdapter {
    ssh_bin: String,
    scp_bin: String,
    keepalive: Keepalive,
}

impl RemoteAdapter {
    pub fn new(
        ssh_bin: impl Into<String>,
        scp_bin: impl Into<String>,
        keepalive: Keepalive,
    ) -> Self {
        RemoteAdapter {
            ssh_bin: ssh_bin.into(),
            scp_bin: scp_bin.into(),
            keepalive,
        }
    }

    fn keepalive_args(&self, cmd: &mut Command) {
        cmd.arg("-o")
            .arg(format!("ServerAliveInterval={}", self.keepalive.interval_secs))
            .arg("-o")
            .arg(format!("ServerAliveCountMax={}", self.keepalive.count_max));
    }

    /// Runs `argv` on `host`, streaming stderr records to `stderr_sink` as
    /// they arrive and returning the process's exit code once it quits.
    pub fn remote_exec(
        &self,
        host: &str,
        argv: &[String],
        mut stderr_sink: impl FnMut(&str),
    ) -> Result<i32> {
        let mut cmd = Command::new(&self.ssh_bin);
        self.keepalive_args(&mut cmd);
        cmd.arg(host).args(argv);
        cmd.stdout(Stdio::null()).stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        let stderr = child.stderr.take().expect("stderr was piped");
        for record in RecordReader::new(stderr) {
            stderr_sink(&record);
        }
        let status = child.wait()?;
        Ok(status.code().unwrap_or(-1))
    }

    /// Copies `source` to `destination`, where one side is of the form
    /// `host:/path` and the other a local path. Forwards each `(percent,
    /// eta)` progress sample parsed from the tool's stdout.
    pub fn remote_copy(
        &self,
        source: &str,
        destination: &str,
        mut progress_sink: impl FnMut(u32, String),
    ) -> Result<i32> {
        let mut cmd = Command::new(&self.scp_bin);
        self.keepalive_args(&mut cmd);
        cmd.arg(source).arg(destination);
        cmd.stdout(Stdio::piped()).stderr(Stdio::null());

        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take().expect("stdout was piped");
        for record in RecordReader::new(stdout) {
            if let Some((percent, eta)) = parse_copy_progress(&record) {
                progress_sink(percent, eta);
            }
        }
        let status = child.wait()?;
        Ok(status.code().unwrap_or(-1))
    }

    /// Probes for the remote transcoder binary at Worker start-up. A
    /// [`FleetError::ConfigurationError`] here keeps the Worker from
    /// starting at all, per the error handling design.
    pub fn probe(&self, host: &str, transcoder: &str) -> Result<()> {
        let mut cmd = Command::new(&self.ssh_bin);
        self.keepalive_args(&mut cmd);
        cmd.arg(host).arg(transcoder).arg("-version");
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
        let status = cmd.status()?;
        if status.success() {
            Ok(())
        } else {
            Err(FleetError::ConfigurationError(format!(
                "{} is not reachable or {} is not installed there",
                host, transcoder
            )))
        }
    }
}

/// Parses a `scp`-style progress record into `(percent, eta)`.
pub fn parse_copy_progress(record: &str) -> Option<(u32, String)> {
    let caps = COPY_PROGRESS.captures(record)?;
    let percent: u32 = caps.get(1)?.as_str().parse().ok()?;
    let eta = caps.get(2)?.as_str().to_string();
    Some((percent, eta))
}

/// Parses a transcoder `-stats` progress record into `(fps, "time=...")`.
pub fn parse_transcode_progress(record: &str) -> Option<(f64, String)> {
    let caps = TRANSCODE_PROGRESS.captures(record)?;
    let fps: f64 = caps.get(1)?.as_str().trim().parse().ok()?;
    let time_code = caps.get(2)?.as_str().to_string();
    Some((fps, time_code))
}

/// Splits a byte stream into records on `\n`, `\r\n`, or bare `\r`. Bare
/// `\r` is the delimiter the transcoder uses for its in-place progress
/// updates; splitting only on `\n` would freeze progress until it exits.
pub struct RecordReader<R> {
    inner: R,
    buf: Vec<u8>,
    pending: Option<u8>,
    done: bool,
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        RecordReader {
            inner,
            buf: Vec::new(),
            pending: None,
            done: false,
        }
    }

    fn read_byte(&mut self) -> std::io::Result<Option<u8>> {
        if let Some(b) = self.pending.take() {
            return Ok(Some(b));
        }
        let mut byte = [0u8; 1];
        match self.inner.read(&mut byte)? {
            0 => Ok(None),
            _ => Ok(Some(byte[0])),
        }
    }

    fn take_record(&mut self) -> String {
        let record = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        record
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.read_byte() {
                Ok(Some(b'\r')) => {
                    // Collapse \r\n into a single delimiter.
                    match self.read_byte() {
                        Ok(Some(b'\n')) => {}
                        Ok(Some(other)) => self.pending = Some(other),
                        Ok(None) => self.done = true,
                        Err(_) => self.done = true,
                    }
                    return Some(self.take_record());
                }
                Ok(Some(b'\n')) => return Some(self.take_record()),
                Ok(Some(b)) => self.buf.push(b),
                Ok(None) => {
                    self.done = true;
                    if self.buf.is_empty() {
                        return None;
                    }
                    return Some(self.take_record());
                }
                Err(_) => {
                    self.done = true;
                    if self.buf.is_empty() {
                        return None;
                    }
                    return Some(self.take_record());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn splits_on_lf() {
        let records: Vec<_> = RecordReader::new(Cursor::new(b"one\ntwo\nthree".to_vec())).collect();
        assert_eq!(records, vec!["one", "two", "three"]);
    }

    #[test]
    fn splits_on_bare_cr() {
        let records: Vec<_> = RecordReader::new(Cursor::new(b"frame=1\rframe=2\rframe=3".to_vec()))
            .collect();
        assert_eq!(records, vec!["frame=1", "frame=2", "frame=3"]);
    }

    #[test]
    fn collapses_crlf_into_one_record() {
        let records: Vec<_> =
            RecordReader::new(Cursor::new(b"one\r\ntwo\r\n".to_vec())).collect();
        assert_eq!(records, vec!["one", "two"]);
    }

    #[test]
    fn mixed_delimiters_never_concatenate_across_boundaries() {
        let records: Vec<_> =
            RecordReader::new(Cursor::new(b"a\rb\r\nc\nd".to_vec())).collect();
        assert_eq!(records, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn parses_documented_scp_progress_pattern() {
        let documented = "42% 00:00:03 ETA";
        let (percent, eta) = parse_copy_progress(documented).unwrap();
        assert_eq!(percent, 42);
        assert_eq!(eta, "00:00:03");
    }

    #[test]
    fn parses_transcode_progress_line() {
        let line = "frame=  120 fps= 42.1 q=28.0 size=   512kB time=00:01:23.45 bitrate=51.2kbits/s";
        let (fps, time_code) = parse_transcode_progress(line).unwrap();
        assert!((fps - 42.1).abs() < f64::EPSILON);
        assert_eq!(time_code, "time=00:01:23.45");
    }

    #[test]
    fn ignores_lines_without_progress() {
        assert!(parse_copy_progress("connected.").is_none());
        assert!(parse_transcode_progress("Input #0, mov,mp4").is_none());
    }
}

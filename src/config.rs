//! Centralized, validated configuration (§10.1): turns raw CLI strings
//! into the typed values every other module consumes, so parsing and
//! range-checking happen in exactly one place.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{FleetError, Result};
use crate::remote::Keepalive;

const DEFAULT_SEGMENT_LENGTH: Duration = Duration::from_secs(60);
const DEFAULT_QLIMIT: usize = 0;
const DEFAULT_REMOTE_TMP: &str = "/tmp";
const DEFAULT_OUTPUT_SUFFIX: &str = "ts";
const DEFAULT_TRANSCODER: &str = "ffmpeg";
const DEFAULT_SSH: &str = "ssh";
const DEFAULT_SCP: &str = "scp";
const LOCAL_TMP_DIR_NAME: &str = "transcode-fleet-tmp";

/// Raw values lifted straight off the CLI, before validation.
#[derive(Debug, Clone)]
pub struct CliArgs<'a> {
    pub input: &'a str,
    pub output: &'a str,
    pub hosts: Vec<&'a str>,
    pub segment_length_secs: Option<&'a str>,
    pub qlimit: Option<&'a str>,
    pub tmp_dir: Option<&'a str>,
    pub keep: bool,
    pub remote_tmp: Option<&'a str>,
    pub output_suffix: Option<&'a str>,
    pub transcoder: Option<&'a str>,
    pub ssh_bin: Option<&'a str>,
    pub scp_bin: Option<&'a str>,
    pub transcoder_args: Vec<&'a str>,
}

/// Fully resolved, validated configuration for one run.
#[derive(Debug, Clone)]
pub struct Config {
    pub input: PathBuf,
    pub output: PathBuf,
    pub hosts: Vec<String>,
    pub segment_length: Duration,
    pub qlimit: usize,
    pub tmp_dir: PathBuf,
    pub keep: bool,
    pub remote_tmp: String,
    pub output_suffix: String,
    pub transcoder: String,
    pub ssh_bin: String,
    pub scp_bin: String,
    pub keepalive: Keepalive,
    pub transcoder_args: Vec<String>,
}

impl Config {
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let mut hosts: Vec<String> = args.hosts.iter().map(|h| h.trim().to_string()).collect();
        hosts.retain(|h| !h.is_empty());
        hosts.sort();
        hosts.dedup();
        if hosts.is_empty() {
            return Err(FleetError::ConfigurationError(
                "at least one host is required".to_string(),
            ));
        }

        let segment_length = match args.segment_length_secs {
            Some(raw) => {
                let secs: u64 = raw.parse().map_err(|_| {
                    FleetError::ConfigurationError(format!("invalid segment length: {}", raw))
                })?;
                if secs == 0 {
                    return Err(FleetError::ConfigurationError(
                        "segment length must be greater than zero".to_string(),
                    ));
                }
                Duration::from_secs(secs)
            }
            None => DEFAULT_SEGMENT_LENGTH,
        };

        let qlimit = match args.qlimit {
            Some(raw) => raw.parse().map_err(|_| {
                FleetError::ConfigurationError(format!("invalid qlimit: {}", raw))
            })?,
            // 0 means "only drain once the shared queue is completely
            // empty" — a legitimate value, not a misconfiguration.
            None => DEFAULT_QLIMIT,
        };

        let tmp_dir = match args.tmp_dir {
            Some(raw) => PathBuf::from(raw),
            None => {
                let mut dir = dirs::home_dir().ok_or_else(|| {
                    FleetError::ConfigurationError("home directory not found".to_string())
                })?;
                dir.push(LOCAL_TMP_DIR_NAME);
                dir
            }
        };

        Ok(Config {
            input: PathBuf::from(args.input),
            output: PathBuf::from(args.output),
            hosts,
            segment_length,
            qlimit,
            tmp_dir,
            keep: args.keep,
            remote_tmp: args
                .remote_tmp
                .unwrap_or(DEFAULT_REMOTE_TMP)
                .to_string(),
            output_suffix: args
                .output_suffix
                .unwrap_or(DEFAULT_OUTPUT_SUFFIX)
                .to_string(),
            transcoder: args.transcoder.unwrap_or(DEFAULT_TRANSCODER).to_string(),
            ssh_bin: args.ssh_bin.unwrap_or(DEFAULT_SSH).to_string(),
            scp_bin: args.scp_bin.unwrap_or(DEFAULT_SCP).to_string(),
            keepalive: Keepalive::default(),
            transcoder_args: if args.transcoder_args.is_empty() {
                default_transcoder_args()
            } else {
                args.transcoder_args.into_iter().map(String::from).collect()
            },
        })
    }
}

fn default_transcoder_args() -> Vec<String> {
    vec![
        "-c:v", "libx264", "-crf", "26", "-preset", "veryslow", "-profile:v", "high", "-level",
        "4.2", "-pix_fmt", "yuv420p",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args<'a>() -> CliArgs<'a> {
        CliArgs {
            input: "in.mp4",
            output: "out.mp4",
            hosts: vec!["b", "a", "a"],
            segment_length_secs: None,
            qlimit: None,
            tmp_dir: Some("/tmp/wherever"),
            keep: false,
            remote_tmp: None,
            output_suffix: None,
            transcoder: None,
            ssh_bin: None,
            scp_bin: None,
            transcoder_args: vec![],
        }
    }

    #[test]
    fn hosts_are_deduped_and_sorted() {
        let config = Config::from_args(base_args()).unwrap();
        assert_eq!(config.hosts, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn rejects_empty_host_list() {
        let mut args = base_args();
        args.hosts = vec!["  ", ""];
        assert!(Config::from_args(args).is_err());
    }

    #[test]
    fn rejects_zero_segment_length() {
        let mut args = base_args();
        args.segment_length_secs = Some("0");
        assert!(Config::from_args(args).is_err());
    }

    #[test]
    fn accepts_zero_qlimit_as_drain_only_when_empty() {
        let mut args = base_args();
        args.qlimit = Some("0");
        assert_eq!(Config::from_args(args).unwrap().qlimit, 0);
    }

    #[test]
    fn falls_back_to_documented_defaults() {
        let config = Config::from_args(base_args()).unwrap();
        assert_eq!(config.segment_length, DEFAULT_SEGMENT_LENGTH);
        assert_eq!(config.qlimit, DEFAULT_QLIMIT);
        assert_eq!(config.remote_tmp, DEFAULT_REMOTE_TMP);
        assert_eq!(config.output_suffix, DEFAULT_OUTPUT_SUFFIX);
        assert!(!config.transcoder_args.is_empty());
    }
}

//! Functions for operations on the local host (§4.1, §6.2): shelling out
//! to `ffmpeg` to split the source file into segments up front and, once
//! every segment comes back transcoded, concatenate them into the final
//! output.

use std::{fs, path::Path, path::PathBuf, process::Command, time::Duration};

use crate::error::{FleetError, Result};

/// Splits `input` into fixed-length segments under `output_dir`, named
/// `segment_%05d.<ext>` so lexicographic order matches temporal order
/// (§6.1).
pub fn split_video(input: &Path, output_dir: &Path, segment_length: Duration) -> Result<()> {
    let extension = input
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("mp4");
    let mut pattern = output_dir.to_path_buf();
    pattern.push(format!("segment_%05d.{}", extension));

    let output = Command::new("ffmpeg")
        .args([
            "-y",
            "-i",
            &path_str(input)?,
            "-c",
            "copy",
            "-map",
            "0",
            "-f",
            "segment",
            "-segment_time",
            &segment_length.as_secs().to_string(),
            &path_str(&pattern)?,
        ])
        .output()?;
    if !output.status.success() {
        return Err(FleetError::ConfigurationError(
            "ffmpeg failed splitting the input into segments".to_string(),
        ));
    }
    Ok(())
}

/// Concatenates the produced, already-sorted segment outputs into
/// `output` using ffmpeg's concat demuxer (§6.2 external interface 2).
pub fn concatenate(produced: &[PathBuf], tmp_dir: &Path, output: &Path) -> Result<()> {
    if produced.is_empty() {
        return Err(FleetError::ConfigurationError(
            "no segments were produced to concatenate".to_string(),
        ));
    }

    let manifest = build_manifest(produced);
    let mut manifest_path = tmp_dir.to_path_buf();
    manifest_path.push("concat.txt");
    fs::write(&manifest_path, manifest)?;

    let result = Command::new("ffmpeg")
        .args([
            "-y",
            "-f",
            "concat",
            "-safe",
            "0",
            "-i",
            &path_str(&manifest_path)?,
            "-c",
            "copy",
            "-movflags",
            "+faststart",
            &path_str(output)?,
        ])
        .output()?;
    if !result.status.success() {
        return Err(FleetError::ConfigurationError(
            "ffmpeg failed concatenating the transcoded segments".to_string(),
        ));
    }
    Ok(())
}

/// Builds the `concat` demuxer's manifest, one `file '<path>'` line per
/// segment in the order given. Pulled out of [`concatenate`] so the
/// format can be checked without invoking ffmpeg.
fn build_manifest(produced: &[PathBuf]) -> String {
    produced
        .iter()
        .map(|path| format!("file '{}'\n", path.display()))
        .collect()
}

fn path_str(path: &Path) -> Result<String> {
    path.to_str().map(str::to_string).ok_or_else(|| {
        FleetError::ConfigurationError(format!("path is not valid UTF-8: {:?}", path))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_lists_one_file_line_per_segment_in_order() {
        let produced = vec![
            PathBuf::from("/tmp/out/segment_00000.out.mp4"),
            PathBuf::from("/tmp/out/segment_00001.out.mp4"),
        ];
        let manifest = build_manifest(&produced);
        assert_eq!(
            manifest,
            "file '/tmp/out/segment_00000.out.mp4'\nfile '/tmp/out/segment_00001.out.mp4'\n"
        );
    }

    #[test]
    fn concatenate_rejects_an_empty_segment_list() {
        let dir = tempfile::tempdir().unwrap();
        let result = concatenate(&[], dir.path(), &dir.path().join("out.mp4"));
        assert!(result.is_err());
    }
}

//! Segments: the immutable units of work produced by the external
//! segmenter and consumed by the dispatch engine (§3, §6.1).

use std::path::{Path, PathBuf};

use crate::error::Result;

/// One fixed-length chunk of the source video. Opaque beyond its path;
/// the Worker derives everything else (remote file name, output name)
/// from the path's basename.
pub type Segment = PathBuf;

/// Reads every regular file out of `chunk_dir` and sorts them
/// lexicographically. Segment file names use zero-padded indices, so
/// lexicographic order is temporal order (§6.1).
pub fn discover(chunk_dir: &Path) -> Result<Vec<Segment>> {
    let mut segments: Vec<Segment> = std::fs::read_dir(chunk_dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .map(|entry| entry.path())
        .collect();
    segments.sort();
    Ok(segments)
}

/// The remote file name a Segment is known by on a host: just its
/// basename, stripped of any directory components.
pub fn basename(segment: &Segment) -> String {
    segment
        .file_name()
        .expect("segment paths name a file")
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn discover_sorts_lexicographically() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["output0002.mp4", "output0000.mp4", "output0001.mp4"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        let segments = discover(dir.path()).unwrap();
        let names: Vec<_> = segments.iter().map(|s| basename(s)).collect();
        assert_eq!(names, vec!["output0000.mp4", "output0001.mp4", "output0002.mp4"]);
    }

    #[test]
    fn discover_ignores_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("output0000.mp4"), b"x").unwrap();
        fs::create_dir(dir.path().join("not_a_segment")).unwrap();
        let segments = discover(dir.path()).unwrap();
        assert_eq!(segments.len(), 1);
    }

    #[test]
    fn basename_strips_directory() {
        let segment: Segment = PathBuf::from("/tmp/chunks/output0003.mp4");
        assert_eq!(basename(&segment), "output0003.mp4");
    }
}

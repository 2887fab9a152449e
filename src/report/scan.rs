//! Secondary sandbox output scan.
//!
//! The runner's report only references attachments it knows about; anything
//! else landing in the output directory (console logs, extra captures,
//! network dumps) is discovered here and classified by extension.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::model::FileType;

/// A file found in the sandbox output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub file_type: FileType,
}

/// Walk `output_dir` and return every regular file not already present in
/// `known_paths`, classified by extension. The runner's own report file is
/// deliberately excluded: its content is already persisted as normalized
/// details and metrics, so storing the raw file again would be redundant.
pub fn scan_output_dir(
    output_dir: &Path,
    report_path: &Path,
    known_paths: &HashSet<PathBuf>,
) -> Vec<ScannedFile> {
    let mut found = Vec::new();
    if !output_dir.exists() {
        return found;
    }

    for entry in WalkDir::new(output_dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path().to_path_buf();
        if path == report_path || known_paths.contains(&path) {
            continue;
        }
        let file_type = path
            .extension()
            .and_then(|e| e.to_str())
            .map(FileType::from_extension)
            .unwrap_or(FileType::Other);
        debug!(path = %path.display(), %file_type, "discovered unreferenced artifact");
        found.push(ScannedFile { path, file_type });
    }

    // Stable order keeps artifact rows deterministic across runs.
    found.sort_by(|a, b| a.path.cmp(&b.path));
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_classifies_and_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("output");
        std::fs::create_dir_all(out.join("nested")).unwrap();
        std::fs::write(out.join("capture.webm"), b"v").unwrap();
        std::fs::write(out.join("shot.png"), b"i").unwrap();
        std::fs::write(out.join("console.log"), b"l").unwrap();
        std::fs::write(out.join("nested").join("trace.zip"), b"t").unwrap();
        std::fs::write(out.join("report.json"), b"{}").unwrap();
        std::fs::write(out.join("known.png"), b"k").unwrap();

        let known: HashSet<PathBuf> = [out.join("known.png")].into_iter().collect();
        let report = out.join("report.json");
        let files = scan_output_dir(&out, &report, &known);

        let types: Vec<FileType> = files.iter().map(|f| f.file_type).collect();
        assert_eq!(files.len(), 4);
        assert!(types.contains(&FileType::Video));
        assert!(types.contains(&FileType::Screenshot));
        assert!(types.contains(&FileType::Log));
        assert!(types.contains(&FileType::Trace));
        assert!(!files.iter().any(|f| f.path == out.join("known.png")));
        assert!(!files.iter().any(|f| f.path == report));
    }

    #[test]
    fn test_scan_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let files = scan_output_dir(
            &dir.path().join("nope"),
            &dir.path().join("nope/report.json"),
            &HashSet::new(),
        );
        assert!(files.is_empty());
    }
}

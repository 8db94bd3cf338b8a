//! Where rendered documents are written.

use std::path::{Path, PathBuf};

use anyhow::Context;
use folio_core::ipc::{JobId, WireOptions};

/// Output type used when a request does not name one.
pub const DEFAULT_TYPE: &str = "html";

/// Path for a job's output.
///
/// An explicit `filename` option wins. Otherwise the file is named
/// `folio-<id>-<pid>.<type>` inside the `directory` option, or the system
/// temp directory.
pub fn output_path(options: &WireOptions, id: &JobId, pid: u32) -> PathBuf {
    if let Some(filename) = options.get_str("filename").filter(|f| !f.is_empty()) {
        return PathBuf::from(filename);
    }

    let directory = options
        .get_str("directory")
        .filter(|d| !d.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    let kind = options
        .get_str("type")
        .filter(|t| !t.is_empty())
        .unwrap_or(DEFAULT_TYPE);

    directory.join(format!("folio-{}-{}.{}", file_safe(id), pid, file_safe_str(kind)))
}

/// Write the document to `path`. The parent directory must exist.
pub fn write_document(path: &Path, html: &str) -> anyhow::Result<()> {
    std::fs::write(path, html).with_context(|| format!("failed to write {}", path.display()))
}

fn file_safe(id: &JobId) -> String {
    file_safe_str(&id.to_string())
}

// Ids are caller-supplied; keep them from escaping the directory.
fn file_safe_str(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::ipc::decode_request;

    fn options(json: &str) -> WireOptions {
        decode_request(&format!(r#"{{"html":"x","options":{json}}}"#))
            .unwrap()
            .options
    }

    #[test]
    fn test_default_path() {
        let path = output_path(&options("{}"), &JobId::Number(7), 4242);
        assert_eq!(path, std::env::temp_dir().join("folio-7-4242.html"));
    }

    #[test]
    fn test_directory_and_type() {
        let path = output_path(
            &options(r#"{"directory":"/srv/out","type":"pdf"}"#),
            &JobId::from("inv-1"),
            1,
        );
        assert_eq!(path, PathBuf::from("/srv/out/folio-inv-1-1.pdf"));
    }

    #[test]
    fn test_explicit_filename_wins() {
        let path = output_path(
            &options(r#"{"filename":"/srv/out/report.pdf","directory":"/elsewhere"}"#),
            &JobId::Number(1),
            1,
        );
        assert_eq!(path, PathBuf::from("/srv/out/report.pdf"));
    }

    #[test]
    fn test_id_cannot_escape_directory() {
        let path = output_path(
            &options(r#"{"directory":"/srv/out"}"#),
            &JobId::from("../../etc/passwd"),
            1,
        );
        assert_eq!(path.parent(), Some(Path::new("/srv/out")));
    }

    #[test]
    fn test_write_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.html");
        write_document(&path, "<p>hi</p>").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "<p>hi</p>");

        let err = write_document(&dir.path().join("missing/out.html"), "x").unwrap_err();
        assert!(err.to_string().contains("failed to write"));
    }
}

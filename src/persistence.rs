use crate::types::{Node, ValueKind};
use anyhow::{bail, Context as _, Result};
use chrono::{DateTime, Local};
use fs_err::{self as fs, File, OpenOptions};
use std::ffi::OsString;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

const EMPTY_DOCUMENT: &str = "{}";

/// `yyyy-MM-dd_HH.mm.ss`
const BACKUP_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H.%M.%S";

/// Distinguishes temporary files of concurrent writers
static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Give up looking for a free backup name after this many suffixes
const MAX_BACKUP_SUFFIX: u32 = 10_000;

/// How a document came to be loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// No file existed; an empty document was written.
    Created,
    /// The file parsed as a document.
    Loaded,
    /// The file was unreadable as a document. Its bytes were copied to `backup`
    /// and the original path now holds an empty document.
    Recovered { backup: PathBuf },
}

/// Load the document stored at `path`.
///
/// Missing files are created holding an empty object, and corrupt files are
/// backed up and replaced (see [`read_with_outcome`]). Only I/O failures are
/// returned as errors.
pub fn read(path: &Path) -> Result<Node> {
    read_with_outcome(path).map(|(document, _)| document)
}

pub fn read_with_outcome(path: &Path) -> Result<(Node, LoadOutcome)> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            write_atomic(path, EMPTY_DOCUMENT.as_bytes())
                .context("Failed to create empty document")?;
            info!("Created new document: {:?}", path);
            return Ok((Node::object(), LoadOutcome::Created));
        }
        Err(err) => return Err(err).context("Failed to read document"),
    };

    match parse_bytes(&bytes) {
        Ok(document) => {
            debug!("Loaded document: {:?}", path);
            Ok((document, LoadOutcome::Loaded))
        }
        Err(reason) => {
            let backup = recover_corrupt(path, &reason)?;
            Ok((Node::object(), LoadOutcome::Recovered { backup }))
        }
    }
}

/// Copy the corrupt file aside, then replace it with an empty document.
///
/// The copy happens first: if it fails the original stays untouched and the
/// I/O error is returned.
fn recover_corrupt(path: &Path, reason: &anyhow::Error) -> Result<PathBuf> {
    let backup = unique_backup_path(path, &Local::now())?;
    fs::copy(path, &backup).context("Failed to back up corrupt document")?;
    write_atomic(path, EMPTY_DOCUMENT.as_bytes())
        .context("Failed to reset corrupt document")?;
    warn!(
        "Corrupt document {:?} ({reason:#}); original saved to {:?}, starting empty",
        path, backup
    );
    Ok(backup)
}

/// Write `document` to `path`, replacing any previous content atomically.
///
/// The content goes to a sibling temporary file which is synced and then
/// renamed over the target, so readers see either the old or the new file.
pub fn write(path: &Path, document: &Node) -> Result<()> {
    let encoded = to_json_string(document)?;
    write_atomic(path, encoded.as_bytes())?;
    debug!("Persisted document to {:?} ({} bytes)", path, encoded.len());
    Ok(())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    write_atomic_with(path, |writer| Ok(writer.write_all(bytes)?))
}

/// Fill a sibling temp file with `fill`, sync it and rename it over `path`.
/// The temp file is removed on every failure.
fn write_atomic_with<F>(path: &Path, fill: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<()>,
{
    let dir = parent_dir(path);
    fs::create_dir_all(dir)?;

    let tmp_path = tmp_path(path);
    let written = write_tmp(&tmp_path, fill).and_then(|()| Ok(fs::rename(&tmp_path, path)?));
    if let Err(err) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }

    if let Ok(dir_file) = File::open(dir) {
        let _ = dir_file.sync_all();
    }
    Ok(())
}

fn write_tmp<F>(tmp_path: &Path, fill: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<()>,
{
    let mut writer = BufWriter::new(
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(tmp_path)?,
    );
    fill(&mut writer)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("document"));
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    name.push(format!(".{}-{n}.tmp", std::process::id()));
    path.with_file_name(name)
}

/// Serialize a document the way it is stored on disk.
///
/// Output is stable: the same tree always yields the same bytes.
pub fn to_json_string(document: &Node) -> Result<String> {
    serde_json::to_string_pretty(&document.to_json()).context("Failed to serialize document")
}

/// Parse document text. The root must be an object.
pub fn parse_document(text: &str) -> Result<Node> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let json: serde_json::Value = serde_json::from_str(text).context("Invalid JSON")?;
    let document = Node::from_json(&json);
    let kind = document.kind();
    if kind != ValueKind::Object {
        bail!("document root is {kind}, expected an object");
    }
    Ok(document)
}

fn parse_bytes(bytes: &[u8]) -> Result<Node> {
    let text = std::str::from_utf8(bytes).context("Document is not valid UTF-8")?;
    parse_document(text)
}

/// `{stem}_backup_{yyyy-MM-dd_HH.mm.ss}{ext}` next to `path`.
pub fn backup_path(path: &Path, timestamp: &DateTime<Local>) -> PathBuf {
    backup_path_with_suffix(path, timestamp, 0)
}

/// Like [`backup_path`]; a non-zero `suffix` is appended as `_{suffix}` before the extension.
pub fn backup_path_with_suffix(path: &Path, timestamp: &DateTime<Local>, suffix: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let stamp = timestamp.format(BACKUP_TIMESTAMP_FORMAT);
    let name = if suffix == 0 {
        format!("{stem}_backup_{stamp}{ext}")
    } else {
        format!("{stem}_backup_{stamp}_{suffix}{ext}")
    };
    path.with_file_name(name)
}

/// First backup name for `timestamp` that does not exist yet.
fn unique_backup_path(path: &Path, timestamp: &DateTime<Local>) -> Result<PathBuf> {
    for suffix in 0..MAX_BACKUP_SUFFIX {
        let candidate = backup_path_with_suffix(path, timestamp, suffix);
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    bail!("No free backup name for {:?}", path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    fn fixed_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 2).unwrap()
    }

    fn backups_in(dir: &Path) -> Vec<PathBuf> {
        let mut found: Vec<PathBuf> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| {
                p.file_name()
                    .unwrap()
                    .to_string_lossy()
                    .contains("_backup_")
            })
            .collect();
        found.sort();
        found
    }

    #[test]
    fn test_backup_path_format() {
        let path = Path::new("/data/cache/settings.json");
        assert_eq!(
            backup_path(path, &fixed_time()),
            PathBuf::from("/data/cache/settings_backup_2024-03-09_07.05.02.json")
        );
    }

    #[test]
    fn test_backup_path_suffix_and_no_extension() {
        let path = Path::new("cache");
        assert_eq!(
            backup_path_with_suffix(path, &fixed_time(), 2),
            PathBuf::from("cache_backup_2024-03-09_07.05.02_2")
        );
    }

    #[test]
    fn test_unique_backup_path_skips_taken_names() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("doc.json");
        let taken = backup_path(&path, &fixed_time());
        std::fs::write(&taken, "x").unwrap();

        let next = unique_backup_path(&path, &fixed_time()).unwrap();
        assert_eq!(next, backup_path_with_suffix(&path, &fixed_time(), 1));
    }

    #[test]
    fn test_read_missing_creates_file_and_parents() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested/deeper/doc.json");

        let (document, outcome) = read_with_outcome(&path).unwrap();
        assert_eq!(outcome, LoadOutcome::Created);
        assert!(document.is_empty());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
    }

    #[test]
    fn test_read_valid_document() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("doc.json");
        std::fs::write(&path, r#"{"a": 1, "b": [true, "x"]}"#).unwrap();

        let (document, outcome) = read_with_outcome(&path).unwrap();
        assert_eq!(outcome, LoadOutcome::Loaded);
        assert_eq!(document.to_json(), json!({"a": 1, "b": [true, "x"]}));
    }

    #[test]
    fn test_read_corrupt_document_recovers() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("doc.json");
        std::fs::write(&path, "{ not json").unwrap();

        let (document, outcome) = read_with_outcome(&path).unwrap();
        assert!(document.is_empty());

        let backups = backups_in(temp_dir.path());
        assert_eq!(backups.len(), 1);
        assert_eq!(outcome, LoadOutcome::Recovered { backup: backups[0].clone() });
        assert_eq!(std::fs::read_to_string(&backups[0]).unwrap(), "{ not json");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
    }

    #[test]
    fn test_non_object_root_is_corrupt() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("doc.json");
        std::fs::write(&path, "[1, 2, 3]").unwrap();

        let (_, outcome) = read_with_outcome(&path).unwrap();
        assert!(matches!(outcome, LoadOutcome::Recovered { .. }));
        assert_eq!(backups_in(temp_dir.path()).len(), 1);
    }

    #[test]
    fn test_invalid_utf8_is_corrupt() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("doc.json");
        std::fs::write(&path, [0xff, 0xfe, 0x7b]).unwrap();

        let (_, outcome) = read_with_outcome(&path).unwrap();
        assert!(matches!(outcome, LoadOutcome::Recovered { .. }));
        let backups = backups_in(temp_dir.path());
        assert_eq!(std::fs::read(&backups[0]).unwrap(), vec![0xff, 0xfe, 0x7b]);
    }

    #[test]
    fn test_repeated_corruption_keeps_every_backup() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("doc.json");
        for attempt in 0..3 {
            std::fs::write(&path, format!("garbage {attempt}")).unwrap();
            read(&path).unwrap();
        }
        assert_eq!(backups_in(temp_dir.path()).len(), 3);
    }

    #[test]
    fn test_parse_accepts_byte_order_mark() {
        let document = parse_document("\u{feff}{\"k\": \"v\"}").unwrap();
        assert_eq!(document.to_json(), json!({"k": "v"}));
    }

    #[test]
    fn test_write_leaves_no_temp_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("doc.json");
        let document = parse_document(r#"{"k": 1}"#).unwrap();

        write(&path, &document).unwrap();

        let names: Vec<String> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["doc.json".to_string()]);
    }

    #[test]
    fn test_failed_write_removes_temp_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("doc.json");

        let result = write_atomic_with(&path, |writer| {
            writer.write_all(b"{\"partial\"")?;
            writer.flush()?;
            bail!("No space left on device")
        });

        assert!(result.is_err());
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_failed_rename_removes_temp_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("occupied");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), "x").unwrap();

        assert!(write(&path, &Node::object()).is_err());

        let names: Vec<String> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["occupied".to_string()]);
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("doc.json");
        let document = parse_document(
            r#"{"s": "text", "i": -4, "f": 2.5, "b": false, "n": null,
                "list": ["a", "b"], "obj": {"deep": {"x": 1}}}"#,
        )
        .unwrap();

        write(&path, &document).unwrap();
        let reread = read(&path).unwrap();
        assert_eq!(reread, document);
    }

    #[test]
    fn test_consecutive_writes_are_byte_identical() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("doc.json");
        let document = parse_document(r#"{"b": 1, "a": {"z": 2.0, "y": [1, 2]}}"#).unwrap();

        write(&path, &document).unwrap();
        let first = std::fs::read(&path).unwrap();
        write(&path, &document).unwrap();
        let second = std::fs::read(&path).unwrap();
        assert_eq!(first, second);
    }

    #[cfg(unix)]
    #[test]
    fn test_write_into_unwritable_dir_fails() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let locked = temp_dir.path().join("locked");
        std::fs::create_dir(&locked).unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o500)).unwrap();

        let path = locked.join("doc.json");
        let result = write(&path, &Node::object());

        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o700)).unwrap();
        // Root ignores directory permissions
        if result.is_ok() {
            return;
        }
        assert!(!path.exists());
    }
}

//! Management sidecars next to the database file.
//!
//! `<db>.log` records workdir-lock acquisition attempts (epoch timestamp,
//! success flag, hostname, environment tag) so an operator staring at a
//! "directory in use" error can see who held it. Reads retain only the
//! last 25 lines. `<db>.note` and `<db>.management/` are created so
//! external tooling has its expected anchors.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

/// Lines retained when reading the log tail.
pub const LOG_TAIL_LINES: usize = 25;

/// Path of the lock-attempt log.
pub fn log_path(db_path: &Path) -> PathBuf {
    sibling(db_path, ".log")
}

/// Path of the note sidecar.
pub fn note_path(db_path: &Path) -> PathBuf {
    sibling(db_path, ".note")
}

/// Path of the management directory.
pub fn management_dir(db_path: &Path) -> PathBuf {
    sibling(db_path, ".management")
}

fn sibling(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = db_path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    db_path.with_file_name(name)
}

/// Creates the management sidecars when absent. Best effort; failures are
/// logged, not fatal.
pub fn prepare(db_path: &Path) {
    let dir = management_dir(db_path);
    if let Err(e) = std::fs::create_dir_all(&dir) {
        warn!(path = %dir.display(), error = %e, "could not create management dir");
    }
    let note = note_path(db_path);
    if !note.exists() {
        if let Err(e) = std::fs::write(&note, b"") {
            warn!(path = %note.display(), error = %e, "could not create note file");
        }
    }
}

/// Appends one lock-acquisition attempt to the log. Best effort.
pub fn log_lock_attempt(db_path: &Path, success: bool) {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let host = hostname();
    let env = std::env::var("TESSERA_ENV").unwrap_or_else(|_| "-".to_string());
    let line = format!(
        "{ts} {} {host} {env}\n",
        if success { "acquired" } else { "failed" }
    );
    let path = log_path(db_path);
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut f| f.write_all(line.as_bytes()));
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "could not append lock log");
    }
}

/// The last [`LOG_TAIL_LINES`] lines of the log, oldest first.
pub fn read_log_tail(db_path: &Path) -> std::io::Result<Vec<String>> {
    let content = match std::fs::read_to_string(log_path(db_path)) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let lines: Vec<String> = content.lines().map(|l| l.to_string()).collect();
    let skip = lines.len().saturating_sub(LOG_TAIL_LINES);
    Ok(lines[skip..].to_vec())
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc == 0 {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        String::from_utf8_lossy(&buf[..end]).into_owned()
    } else {
        "unknown".to_string()
    }
}

#[cfg(not(unix))]
fn hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_appends_and_tail_caps_at_25() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("x.tsra");
        for _ in 0..30 {
            log_lock_attempt(&db, true);
        }
        log_lock_attempt(&db, false);
        let tail = read_log_tail(&db).unwrap();
        assert_eq!(tail.len(), LOG_TAIL_LINES);
        assert!(tail.last().unwrap().contains("failed"));
        assert!(tail.first().unwrap().contains("acquired"));
    }

    #[test]
    fn tail_of_missing_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_log_tail(&dir.path().join("none.tsra"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn prepare_creates_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("side.tsra");
        prepare(&db);
        assert!(management_dir(&db).is_dir());
        assert!(note_path(&db).exists());
    }
}

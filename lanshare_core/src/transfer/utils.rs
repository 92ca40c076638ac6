use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};

use super::constants::MAX_FILENAME_LENGTH;
use crate::error::RejectReason;

/// Windows device names that cannot be used as file names
const RESERVED_NAMES: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

const FALLBACK_NAME: &str = "unknown_file";

/// Check an offer against the receiver's size limit.
/// Over-long names are not rejected; `sanitize_file_name` truncates them.
pub fn validate_offer(file_size: u64, max_file_size: u64) -> Result<(), RejectReason> {
    if file_size > max_file_size {
        return Err(RejectReason::FileTooLarge);
    }
    Ok(())
}

/// Reduce a peer-supplied name to a single safe path component
pub fn sanitize_file_name(file_name: &str) -> String {
    // Take the last component, whichever separator the sender's OS uses
    let last = file_name.rsplit(['/', '\\']).next().unwrap_or_default();

    let clean: String = last.chars().filter(|c| !c.is_control()).collect();
    let trimmed = clean.trim();

    if trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || RESERVED_NAMES.iter().any(|r| trimmed.eq_ignore_ascii_case(r))
    {
        return FALLBACK_NAME.to_string();
    }

    if trimmed.len() <= MAX_FILENAME_LENGTH {
        return trimmed.to_string();
    }

    // Too long: keep a short extension if there is one
    match trimmed.rfind('.') {
        Some(idx) if trimmed.len() - idx < 20 => {
            let ext = &trimmed[idx..];
            let mut base = trimmed[..idx].to_string();
            truncate_at_char_boundary(&mut base, MAX_FILENAME_LENGTH - ext.len());
            base.push_str(ext);
            base
        }
        _ => {
            let mut name = trimmed.to_string();
            truncate_at_char_boundary(&mut name, MAX_FILENAME_LENGTH);
            name
        }
    }
}

fn truncate_at_char_boundary(s: &mut String, max_len: usize) {
    let mut cutoff = max_len.min(s.len());
    while !s.is_char_boundary(cutoff) {
        cutoff -= 1;
    }
    s.truncate(cutoff);
}

/// Candidate path for the n-th collision: `name.ext`, `name_1.ext`, `name_2.ext`, ...
fn numbered_path(dir: &Path, file_name: &str, n: u32) -> PathBuf {
    if n == 0 {
        return dir.join(file_name);
    }
    let path = Path::new(file_name);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(FALLBACK_NAME);
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => dir.join(format!("{}_{}.{}", stem, n, ext)),
        None => dir.join(format!("{}_{}", stem, n)),
    }
}

/// Create a new destination file without overwriting anything already there.
///
/// The name is reserved atomically with `create_new`, so two concurrent
/// receives of the same name end up in different files.
pub async fn create_unique_file(dir: &Path, file_name: &str) -> std::io::Result<(PathBuf, File)> {
    tokio::fs::create_dir_all(dir).await?;

    let mut n = 0u32;
    loop {
        let candidate = numbered_path(dir, file_name, n);
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        match options.open(&candidate).await {
            Ok(file) => return Ok((candidate, file)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && n < 10_000 => n += 1,
            Err(e) => return Err(e),
        }
    }
}

/// Destination file that is removed unless the transfer completes.
///
/// Removal happens in `Drop`, so every exit path of the receiving session
/// (error, cancellation, panic) cleans up the partial file.
pub struct PartialFile {
    path: PathBuf,
    keep: bool,
}

impl PartialFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the file on disk; called once the checksum matched
    pub fn persist(mut self) -> PathBuf {
        self.keep = true;
        std::mem::take(&mut self.path)
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.keep {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Could not remove partial file {:?}: {}", self.path, e);
                }
            } else {
                tracing::debug!("Removed partial file {:?}", self.path);
            }
        }
    }
}

/// Free space on the disk that holds (or will hold) `dir`, if it can be determined
pub fn available_space(dir: &Path) -> Option<u64> {
    // The download directory may not exist yet; measure its closest existing ancestor
    let dir = dir.ancestors().find(|p| p.exists())?.canonicalize().ok()?;
    let disks = sysinfo::Disks::new_with_refreshed_list();

    // The disk with the longest mount point that contains `dir`
    disks
        .list()
        .iter()
        .filter(|d| dir.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}

/// Format a transfer speed in bytes per second
pub fn format_speed(speed_bps: Option<f64>) -> String {
    match speed_bps {
        None => "Starting...".to_string(),
        Some(bps) if bps > 1_000_000.0 => format!("{:.2} MB/s", bps / 1_000_000.0),
        Some(bps) if bps > 1_000.0 => format!("{:.1} KB/s", bps / 1_000.0),
        Some(bps) => format!("{:.0} B/s", bps),
    }
}

/// Format an ETA as `"Xm YYs"`, or `"unknown"`
pub fn format_eta(eta: Option<Duration>) -> String {
    match eta {
        None => "unknown".to_string(),
        Some(d) => {
            let secs = d.as_secs();
            format!("{}m {:02}s", secs / 60, secs % 60)
        }
    }
}

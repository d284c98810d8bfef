//! Index construction: header-only fragment scanning, crashed-session
//! recovery, and archive pruning.
//!
//! The scan never reads packet bodies. Unreadable or damaged files are
//! logged and skipped so one bad fragment cannot abort a rebuild.

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::lock;
use crate::fragment::{header as fragment_header, read_fragment_header, FragmentHeader};
use crate::session::SessionStatus;

/// One indexed fragment file.
#[derive(Debug, Clone)]
pub struct FragmentRecord {
    /// Fragment id from the header.
    pub fragment_id: Uuid,
    /// 0-based position within the session.
    pub file_sequence: u32,
    /// Current location on disk.
    pub path: PathBuf,
    /// True when the fragment lives in the repository root (not archived).
    pub is_new: bool,
    /// Fragment open time.
    pub start_time: OffsetDateTime,
    /// Last activity recorded in the fragment.
    pub end_time: OffsetDateTime,
    /// File size in bytes.
    pub size: u64,
}

/// Everything the index knows about one session.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    /// Session id shared by the fragments.
    pub session_id: Uuid,
    /// Header of the newest fragment; carries the freshest counters.
    pub header: FragmentHeader,
    /// Session status under the monotonic rule: the furthest-along status
    /// any fragment reports.
    pub status: SessionStatus,
    /// Fragments sorted by file sequence.
    pub fragments: Vec<FragmentRecord>,
    /// True when a process currently owns the session.
    pub is_running: bool,
}

impl SessionEntry {
    /// Total bytes across this session's fragments.
    pub fn total_size(&self) -> u64 {
        self.fragments.iter().map(|fragment| fragment.size).sum()
    }

    /// True when every fragment has been archived.
    pub fn is_archived(&self) -> bool {
        !self.fragments.is_empty() && self.fragments.iter().all(|fragment| !fragment.is_new)
    }
}

/// Which fragments a rebuild should scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionScope {
    /// Root and archive.
    #[default]
    All,
    /// Only fragments still marked new (repository root).
    NewOnly,
}

/// Scans fragment headers and assembles the session map, running crashed
/// session recovery along the way.
pub(crate) fn build_index(
    root: &Path,
    archive_dir: &Path,
    lock_dir: &Path,
    live_sessions: &HashSet<Uuid>,
    scope: SessionScope,
) -> HashMap<Uuid, SessionEntry> {
    let mut grouped: HashMap<Uuid, Vec<(FragmentHeader, FragmentRecord)>> = HashMap::new();
    scan_directory(root, true, &mut grouped);
    if scope == SessionScope::All {
        scan_directory(archive_dir, false, &mut grouped);
    }

    let mut entries = HashMap::with_capacity(grouped.len());
    for (session_id, mut fragments) in grouped {
        fragments.sort_by_key(|(_, record)| record.file_sequence);
        let status = fragments
            .iter()
            .fold(SessionStatus::Unknown, |acc, (header, _)| {
                acc.advance(header.status)
            });
        let newest_header = fragments
            .last()
            .map(|(header, _)| header.clone())
            .expect("group contains at least one fragment");

        // Liveness is probed fresh on every rebuild; the previous value is
        // never reused.
        let is_running = live_sessions.contains(&session_id)
            || lock::is_locked_elsewhere(lock_dir, session_id).unwrap_or(false);

        let mut entry = SessionEntry {
            session_id,
            header: newest_header,
            status,
            fragments: fragments.into_iter().map(|(_, record)| record).collect(),
            is_running,
        };

        if entry.status == SessionStatus::Running && !entry.is_running {
            recover_crashed(&mut entry, lock_dir);
        }
        entries.insert(session_id, entry);
    }
    entries
}

fn scan_directory(
    dir: &Path,
    is_new: bool,
    grouped: &mut HashMap<Uuid, Vec<(FragmentHeader, FragmentRecord)>>,
) {
    let reader = match std::fs::read_dir(dir) {
        Ok(reader) => reader,
        Err(err) => {
            debug!(dir = %dir.display(), error = %err, "repo.scan.dir_unreadable");
            return;
        }
    };
    for entry in reader {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                debug!(error = %err, "repo.scan.entry_unreadable");
                continue;
            }
        };
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("glf") {
            continue;
        }
        let size = match entry.metadata() {
            Ok(metadata) => metadata.len(),
            Err(err) => {
                debug!(path = %path.display(), error = %err, "repo.scan.metadata_failed");
                continue;
            }
        };
        let header = match read_fragment_header(&path) {
            Ok(header) => header,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "repo.scan.header_unreadable");
                continue;
            }
        };
        let record = FragmentRecord {
            fragment_id: header.fragment_id,
            file_sequence: header.file_sequence,
            path,
            is_new,
            start_time: header.fragment_start_time,
            end_time: header.fragment_end_time,
            size,
        };
        grouped
            .entry(header.summary.id)
            .or_default()
            .push((header, record));
    }
}

// Converts every fragment header of an orphaned Running session to Crashed.
// Per-fragment failures are logged and skipped; the remaining fragments are
// still attempted.
fn recover_crashed(entry: &mut SessionEntry, lock_dir: &Path) {
    info!(session_id = %entry.session_id, "repo.recovery.converting");
    let mut converted = 0usize;
    for fragment in &entry.fragments {
        let result = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&fragment.path)
            .map_err(crate::error::AgentError::from)
            .and_then(|mut file| {
                fragment_header::patch_status(&mut file, SessionStatus::Crashed)
            });
        match result {
            Ok(()) => converted += 1,
            Err(err) => warn!(
                path = %fragment.path.display(),
                error = %err,
                "repo.recovery.fragment_skipped"
            ),
        }
    }
    lock::remove_stale_lock(lock_dir, entry.session_id);
    entry.status = SessionStatus::Crashed;
    entry.header.status = SessionStatus::Crashed;
    info!(
        session_id = %entry.session_id,
        converted,
        total = entry.fragments.len(),
        "repo.recovery.done"
    );
}

/// Limits applied to archived sessions during a rebuild.
#[derive(Debug, Clone, Copy, Default)]
pub struct PruneLimits {
    /// Total archive budget in bytes; `None` disables size pruning.
    pub max_bytes: Option<u64>,
    /// Maximum archived session age; `None` disables age pruning.
    pub max_age: Option<time::Duration>,
}

impl PruneLimits {
    pub(crate) fn is_enabled(&self) -> bool {
        self.max_bytes.is_some() || self.max_age.is_some()
    }
}

// Deletes archived sessions oldest-first until the limits hold. Running and
// new sessions are never touched.
pub(crate) fn prune_archive(
    entries: &mut HashMap<Uuid, SessionEntry>,
    limits: &PruneLimits,
    now: OffsetDateTime,
) {
    if !limits.is_enabled() {
        return;
    }
    let mut candidates: Vec<(Uuid, OffsetDateTime, u64)> = entries
        .values()
        .filter(|entry| entry.is_archived() && !entry.is_running)
        .map(|entry| (entry.session_id, entry.header.end_time, entry.total_size()))
        .collect();
    candidates.sort_by_key(|(_, end_time, _)| *end_time);

    let mut doomed: Vec<Uuid> = Vec::new();
    if let Some(max_age) = limits.max_age {
        let cutoff = now - max_age;
        for (session_id, end_time, _) in &candidates {
            if *end_time < cutoff {
                doomed.push(*session_id);
            }
        }
    }
    if let Some(max_bytes) = limits.max_bytes {
        let mut total: u64 = candidates
            .iter()
            .filter(|(id, _, _)| !doomed.contains(id))
            .map(|(_, _, size)| size)
            .sum();
        for (session_id, _, size) in &candidates {
            if total <= max_bytes {
                break;
            }
            if doomed.contains(session_id) {
                continue;
            }
            doomed.push(*session_id);
            total = total.saturating_sub(*size);
        }
    }

    for session_id in doomed {
        if let Some(entry) = entries.remove(&session_id) {
            info!(
                session_id = %session_id,
                bytes = entry.total_size(),
                "repo.prune.session_removed"
            );
            for fragment in entry.fragments {
                if let Err(err) = std::fs::remove_file(&fragment.path) {
                    warn!(
                        path = %fragment.path.display(),
                        error = %err,
                        "repo.prune.delete_failed"
                    );
                }
            }
        }
    }
}

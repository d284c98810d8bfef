//! The local session repository.
//!
//! Disk layout, rooted at `<base>/<sanitized product name>/`:
//!
//! ```text
//! *.glf            current (new) fragments
//! archive/*.glf    archived fragments
//! _lockdir/<uuid>  per-session advisory lock files
//! repository.gak   repository UUID, UTF-8
//! computer.gak     computer UUID, UTF-8
//! _readme.txt      human-readable notice
//! temp/            scratch space for streaming copies
//! ```
//!
//! The in-memory index maps session id to its fragments and aggregated
//! header. Rebuilds read only headers, run crashed-session recovery, apply
//! archive pruning, and replace the map atomically under one coarse lock.

pub mod index;
pub(crate) mod lock;
mod refresh;

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use index::{FragmentRecord, PruneLimits, SessionEntry, SessionScope};
use lock::SessionLock;
use refresh::{RefreshRequest, RefreshWorker};

use crate::error::{AgentError, Result};
use crate::fragment::{
    fragment_file_name, read_fragment, read_fragment_header, FragmentHeader, HeaderCounts,
};
use crate::packet::codec::PacketEncoder;
use crate::packet::Packet;
use crate::session::{SessionStatus, SessionSummary};

const README_TEXT: &str = "This directory holds diagnostic session fragments (.glf) written by the \
Lantern agent.\nFiles are safe to copy while the owning application runs; do not edit them in \
place.\n";

/// Replaces characters that cannot appear in a directory name.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_owned()
    } else {
        cleaned
    }
}

/// Where and how to open a repository.
#[derive(Debug, Clone)]
pub struct RepositoryOptions {
    /// Base folder; the product subdirectory is created inside it.
    pub base_folder: PathBuf,
    /// Product name, sanitized into the subdirectory name.
    pub product_name: String,
    /// Archive pruning limits.
    pub prune: PruneLimits,
}

impl RepositoryOptions {
    /// Options rooted at the platform's local-data directory.
    pub fn for_product(product_name: &str) -> Self {
        let base_folder = dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("lantern");
        Self {
            base_folder,
            product_name: product_name.to_owned(),
            prune: PruneLimits::default(),
        }
    }
}

/// A session composed from all of its fragments.
#[derive(Debug)]
pub struct Session {
    /// Session description from the fragment headers.
    pub summary: SessionSummary,
    /// Aggregated status under the monotonic rule.
    pub status: SessionStatus,
    /// Counters from the newest fragment.
    pub counters: HeaderCounts,
    /// Last activity across fragments.
    pub end_time: OffsetDateTime,
    /// Every decoded packet, in fragment order then publish order.
    pub packets: Vec<Packet>,
    /// True when any fragment's stream was cut short by corruption.
    pub has_corrupt_data: bool,
    /// Lower bound of packets lost to corruption.
    pub packets_lost: u64,
}

pub(crate) struct RepoInner {
    root: PathBuf,
    archive_dir: PathBuf,
    lock_dir: PathBuf,
    temp_dir: PathBuf,
    repository_id: Uuid,
    prune: PruneLimits,
    index: Mutex<HashMap<Uuid, SessionEntry>>,
    built: AtomicBool,
    live_locks: Mutex<HashMap<Uuid, SessionLock>>,
}

/// Handle to one product's local repository.
pub struct LocalRepository {
    inner: Arc<RepoInner>,
    refresh_worker: RefreshWorker,
}

impl LocalRepository {
    /// Creates the directory layout if needed, loads the index, and spawns
    /// the async refresh worker.
    pub fn open(options: RepositoryOptions) -> Result<Self> {
        let root = options
            .base_folder
            .join(sanitize_file_name(&options.product_name));
        let archive_dir = root.join("archive");
        let lock_dir = root.join("_lockdir");
        let temp_dir = root.join("temp");
        for dir in [&root, &archive_dir, &lock_dir, &temp_dir] {
            std::fs::create_dir_all(dir)?;
        }
        let repository_id = ensure_marker_uuid(&root.join("repository.gak"))?;
        ensure_marker_uuid(&root.join("computer.gak"))?;
        ensure_readme(&root.join("_readme.txt"))?;

        let inner = Arc::new(RepoInner {
            root,
            archive_dir,
            lock_dir,
            temp_dir,
            repository_id,
            prune: options.prune,
            index: Mutex::new(HashMap::new()),
            built: AtomicBool::new(false),
            live_locks: Mutex::new(HashMap::new()),
        });
        inner.rebuild(SessionScope::All);
        let refresh_worker = RefreshWorker::spawn(Arc::downgrade(&inner))?;
        info!(
            root = %inner.root.display(),
            repository_id = %repository_id,
            "repo.opened"
        );
        Ok(Self {
            inner,
            refresh_worker,
        })
    }

    /// This repository's stable id.
    pub fn repository_id(&self) -> Uuid {
        self.inner.repository_id
    }

    /// Directory new fragments are written into.
    pub fn fragment_directory(&self) -> &Path {
        &self.inner.root
    }

    /// Takes the per-session writer lock for a live session. Fails when
    /// another process owns the session.
    pub fn acquire_session_lock(&self, session_id: Uuid) -> Result<()> {
        match SessionLock::acquire(&self.inner.lock_dir, session_id)? {
            Some(lock) => {
                self.inner.live_locks.lock().insert(session_id, lock);
                Ok(())
            }
            None => Err(AgentError::InvalidArgument(format!(
                "session {session_id} is locked by another process"
            ))),
        }
    }

    /// Releases the writer lock taken by `acquire_session_lock`.
    pub fn release_session_lock(&self, session_id: Uuid) {
        if let Some(lock) = self.inner.live_locks.lock().remove(&session_id) {
            lock.release();
        }
    }

    /// Imports a serialized fragment. Returns false (leaving the existing
    /// file untouched) when the fragment is already present.
    pub fn add_session(&self, stream: &mut dyn Read) -> Result<bool> {
        let temp_path = self.inner.temp_dir.join(format!("{}.tmp", Uuid::new_v4()));
        let mut temp = File::create(&temp_path)?;
        std::io::copy(stream, &mut temp)?;
        temp.sync_data()?;
        drop(temp);

        let header = match read_fragment_header(&temp_path) {
            Ok(header) => header,
            Err(err) => {
                let _ = std::fs::remove_file(&temp_path);
                return Err(err);
            }
        };
        let file_name = fragment_file_name(
            header.summary.id,
            header.fragment_id,
            header.file_sequence,
        );
        let destination = self.inner.root.join(&file_name);
        if destination.exists() {
            let _ = std::fs::remove_file(&temp_path);
            return Ok(false);
        }
        std::fs::rename(&temp_path, &destination)?;
        let size = std::fs::metadata(&destination)?.len();
        self.inner.insert_fragment(header, destination, size);
        Ok(true)
    }

    /// Composes a session from its fragments, optionally filtered.
    pub fn get_session(
        &self,
        session_id: Uuid,
        fragment_filter: Option<&dyn Fn(&FragmentRecord) -> bool>,
    ) -> Result<Session> {
        let entry = self
            .inner
            .entry(session_id)?;
        let mut packets = Vec::new();
        let mut has_corrupt_data = false;
        let mut packets_lost = 0u64;
        for record in &entry.fragments {
            if let Some(filter) = fragment_filter {
                if !filter(record) {
                    continue;
                }
            }
            match read_fragment(&record.path) {
                Ok(read) => {
                    has_corrupt_data |= read.corrupt;
                    packets_lost += read.packets_lost;
                    packets.extend(read.packets);
                }
                Err(err) => {
                    // Whole-fragment failures are isolated like mid-stream
                    // corruption; the other fragments still compose.
                    warn!(
                        path = %record.path.display(),
                        error = %err,
                        "repo.get_session.fragment_unreadable"
                    );
                    has_corrupt_data = true;
                    packets_lost += 1;
                }
            }
        }
        Ok(Session {
            summary: entry.header.summary.clone(),
            status: entry.status,
            counters: entry.header.counters,
            end_time: entry.header.end_time,
            packets,
            has_corrupt_data,
            packets_lost,
        })
    }

    /// Serializes the composed session into a fresh temp file and returns a
    /// seekable reader. A single-fragment session is copied raw.
    pub fn get_session_stream(&self, session_id: Uuid) -> Result<File> {
        let entry = self.inner.entry(session_id)?;
        let temp_path = self.inner.temp_dir.join(format!("{}.glf", Uuid::new_v4()));
        if let [only] = entry.fragments.as_slice() {
            // Fast path: no deserialization needed, the raw bytes are the
            // stream.
            std::fs::copy(&only.path, &temp_path)?;
        } else {
            let session = self.get_session(session_id, None)?;
            let header = FragmentHeader {
                summary: session.summary.clone(),
                fragment_id: Uuid::new_v4(),
                file_sequence: 0,
                status: session.status,
                end_time: session.end_time,
                fragment_start_time: session.summary.start_time,
                fragment_end_time: session.end_time,
                counters: session.counters,
            };
            let mut out = File::create(&temp_path)?;
            out.write_all(&header.encode()?)?;
            let mut encoder = PacketEncoder::new();
            let mut buf = Vec::with_capacity(8192);
            for packet in &session.packets {
                buf.clear();
                encoder.encode(packet, &mut buf)?;
                out.write_all(&buf)?;
            }
            out.sync_data()?;
        }
        let mut file = File::open(&temp_path)?;
        file.seek(SeekFrom::Start(0))?;
        Ok(file)
    }

    /// Read-only shared handle to one fragment file.
    pub fn get_session_file_stream(&self, session_id: Uuid, fragment_id: Uuid) -> Result<File> {
        let entry = self.inner.entry(session_id)?;
        let record = entry
            .fragments
            .iter()
            .find(|record| record.fragment_id == fragment_id)
            .ok_or(AgentError::NotFound("fragment"))?;
        Ok(File::open(&record.path)?)
    }

    /// The aggregated header plus the paths of every fragment, in order.
    pub fn load_session_files(&self, session_id: Uuid) -> Result<(FragmentHeader, Vec<PathBuf>)> {
        let entry = self.inner.entry(session_id)?;
        let paths = entry
            .fragments
            .iter()
            .map(|record| record.path.clone())
            .collect();
        Ok((entry.header, paths))
    }

    /// Linear scan over the indexed sessions.
    pub fn find(&self, predicate: impl Fn(&SessionEntry) -> bool) -> Vec<SessionEntry> {
        self.inner
            .index
            .lock()
            .values()
            .filter(|entry| predicate(entry))
            .cloned()
            .collect()
    }

    /// Deletes every fragment of a session. Returns false when the session
    /// is unknown.
    pub fn remove_session(&self, session_id: Uuid) -> Result<bool> {
        let Some(entry) = self.inner.index.lock().remove(&session_id) else {
            return Ok(false);
        };
        for fragment in &entry.fragments {
            if let Err(err) = std::fs::remove_file(&fragment.path) {
                warn!(
                    path = %fragment.path.display(),
                    error = %err,
                    "repo.remove.delete_failed"
                );
            }
        }
        lock::remove_stale_lock(&self.inner.lock_dir, session_id);
        Ok(true)
    }

    /// Deletes one fragment of a session.
    pub fn remove_session_fragment(&self, session_id: Uuid, fragment_id: Uuid) -> Result<bool> {
        let mut index = self.inner.index.lock();
        let Some(entry) = index.get_mut(&session_id) else {
            return Ok(false);
        };
        let Some(position) = entry
            .fragments
            .iter()
            .position(|record| record.fragment_id == fragment_id)
        else {
            return Ok(false);
        };
        let record = entry.fragments.remove(position);
        if entry.fragments.is_empty() {
            index.remove(&session_id);
        }
        drop(index);
        std::fs::remove_file(&record.path)?;
        Ok(true)
    }

    /// Deletes several sessions; returns how many existed.
    pub fn remove_sessions(&self, session_ids: &[Uuid]) -> Result<usize> {
        let mut removed = 0;
        for session_id in session_ids {
            if self.remove_session(*session_id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Moves sessions between the root (new) and `archive/`, keeping file
    /// names stable.
    pub fn set_sessions_new(&self, session_ids: &[Uuid], is_new: bool) -> Result<()> {
        let mut index = self.inner.index.lock();
        for session_id in session_ids {
            let Some(entry) = index.get_mut(session_id) else {
                continue;
            };
            for record in &mut entry.fragments {
                if record.is_new == is_new {
                    continue;
                }
                let target_dir = if is_new {
                    &self.inner.root
                } else {
                    &self.inner.archive_dir
                };
                let file_name = record
                    .path
                    .file_name()
                    .ok_or(AgentError::NotFound("fragment file name"))?
                    .to_owned();
                let target = target_dir.join(file_name);
                std::fs::rename(&record.path, &target)?;
                record.path = target;
                record.is_new = is_new;
            }
        }
        Ok(())
    }

    /// Rebuilds the index synchronously. Without `force` the call is a
    /// no-op when an index already exists.
    pub fn refresh(&self, force: bool, scope: SessionScope) {
        if !force && self.inner.built.load(Ordering::Acquire) {
            return;
        }
        self.inner.rebuild(scope);
    }

    /// Enqueues a rebuild on the refresh worker; overflow coalesces.
    pub fn refresh_async(&self, scope: SessionScope) {
        self.refresh_worker.request(RefreshRequest { scope });
    }

    /// True when the index knows the session.
    pub fn session_exists(&self, session_id: Uuid) -> bool {
        self.inner.index.lock().contains_key(&session_id)
    }

    /// Probes liveness right now: the in-process lock table first, then the
    /// on-disk lock.
    pub fn session_is_running(&self, session_id: Uuid) -> bool {
        if self.inner.live_locks.lock().contains_key(&session_id) {
            return true;
        }
        lock::is_locked_elsewhere(&self.inner.lock_dir, session_id).unwrap_or(false)
    }

    /// True when at least one fragment file is still on disk.
    pub fn session_data_exists(&self, session_id: Uuid) -> bool {
        self.inner
            .index
            .lock()
            .get(&session_id)
            .map(|entry| entry.fragments.iter().any(|record| record.path.exists()))
            .unwrap_or(false)
    }

    /// Fragment ids of a session, in file-sequence order.
    pub fn get_session_file_ids(&self, session_id: Uuid) -> Vec<Uuid> {
        self.inner
            .index
            .lock()
            .get(&session_id)
            .map(|entry| {
                entry
                    .fragments
                    .iter()
                    .map(|record| record.fragment_id)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl RepoInner {
    fn entry(&self, session_id: Uuid) -> Result<SessionEntry> {
        self.index
            .lock()
            .get(&session_id)
            .cloned()
            .ok_or(AgentError::NotFound("session"))
    }

    pub(crate) fn rebuild(&self, scope: SessionScope) {
        debug!(?scope, "repo.refresh.start");
        let live: HashSet<Uuid> = self.live_locks.lock().keys().copied().collect();
        let mut entries = index::build_index(
            &self.root,
            &self.archive_dir,
            &self.lock_dir,
            &live,
            scope,
        );
        if scope == SessionScope::NewOnly {
            // Carry archived knowledge forward; this scope only rescans the
            // root folder.
            let previous = self.index.lock();
            for (session_id, old_entry) in previous.iter() {
                let archived: Vec<FragmentRecord> = old_entry
                    .fragments
                    .iter()
                    .filter(|record| !record.is_new)
                    .cloned()
                    .collect();
                if archived.is_empty() {
                    continue;
                }
                match entries.entry(*session_id) {
                    Entry::Occupied(mut slot) => {
                        let entry = slot.get_mut();
                        for record in archived {
                            if !entry
                                .fragments
                                .iter()
                                .any(|existing| existing.file_sequence == record.file_sequence)
                            {
                                entry.fragments.push(record);
                            }
                        }
                        entry.fragments.sort_by_key(|record| record.file_sequence);
                        entry.status = entry.status.advance(old_entry.status);
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(old_entry.clone());
                    }
                }
            }
        } else if self.prune.is_enabled() {
            index::prune_archive(&mut entries, &self.prune, OffsetDateTime::now_utc());
        }
        let count = entries.len();
        *self.index.lock() = entries;
        self.built.store(true, Ordering::Release);
        debug!(sessions = count, "repo.refresh.done");
    }

    fn insert_fragment(&self, header: FragmentHeader, path: PathBuf, size: u64) {
        let record = FragmentRecord {
            fragment_id: header.fragment_id,
            file_sequence: header.file_sequence,
            path,
            is_new: true,
            start_time: header.fragment_start_time,
            end_time: header.fragment_end_time,
            size,
        };
        let mut index = self.index.lock();
        match index.entry(header.summary.id) {
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                entry.status = entry.status.advance(header.status);
                if record.file_sequence
                    >= entry
                        .fragments
                        .last()
                        .map(|last| last.file_sequence)
                        .unwrap_or(0)
                {
                    entry.header = header;
                }
                entry.fragments.push(record);
                entry.fragments.sort_by_key(|fragment| fragment.file_sequence);
            }
            Entry::Vacant(slot) => {
                let session_id = header.summary.id;
                let status = header.status;
                slot.insert(SessionEntry {
                    session_id,
                    header,
                    status,
                    fragments: vec![record],
                    is_running: false,
                });
            }
        }
    }
}

fn ensure_marker_uuid(path: &Path) -> Result<Uuid> {
    match std::fs::read_to_string(path) {
        Ok(text) => {
            if let Ok(id) = Uuid::parse_str(text.trim()) {
                return Ok(id);
            }
            warn!(path = %path.display(), "repo.marker.rewriting_invalid");
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    let id = Uuid::new_v4();
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(id.to_string().as_bytes())?;
    Ok(id)
}

fn ensure_readme(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::write(path, README_TEXT)?;
    }
    Ok(())
}

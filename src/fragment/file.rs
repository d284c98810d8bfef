use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use time::OffsetDateTime;
use uuid::Uuid;

use super::header::{self, FragmentHeader};
use crate::error::Result;
use crate::packet::codec::PacketEncoder;
use crate::packet::Packet;
use crate::session::{SessionContext, SessionCounters};

/// Canonical fragment file name: `{session}-{fragment}-{sequence}.glf`.
pub fn fragment_file_name(session_id: Uuid, fragment_id: Uuid, file_sequence: u32) -> String {
    format!("{session_id}-{fragment_id}-{file_sequence}.glf")
}

/// The currently-open fragment owned by the spool thread.
///
/// Appends go to the end of the file; `flush` rewrites the header's
/// updatable region and syncs. Nothing here rotates; the spool decides when
/// a fragment is finished.
#[derive(Debug)]
pub struct FragmentFile {
    file: File,
    path: PathBuf,
    fragment_id: Uuid,
    file_sequence: u32,
    encoder: PacketEncoder,
    bytes_written: u64,
    opened_at: OffsetDateTime,
    scratch: Vec<u8>,
}

impl FragmentFile {
    /// Creates the next fragment for the session in `dir`, writing its
    /// header immediately so the file is recognizable from the first byte.
    pub fn create(
        dir: &Path,
        context: &SessionContext,
        file_sequence: u32,
        now: OffsetDateTime,
    ) -> Result<Self> {
        let fragment_id = Uuid::new_v4();
        let counters = context.counters();
        let file_name =
            fragment_file_name(context.summary().id, fragment_id, file_sequence);
        let path = dir.join(file_name);
        let header = FragmentHeader::new(
            context.summary().clone(),
            fragment_id,
            file_sequence,
            &counters,
            now,
        );
        let encoded = header.encode()?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.write_all(&encoded)?;
        Ok(Self {
            file,
            path,
            fragment_id,
            file_sequence,
            encoder: PacketEncoder::new(),
            bytes_written: encoded.len() as u64,
            opened_at: now,
            scratch: Vec::with_capacity(4096),
        })
    }

    /// Id of this fragment.
    pub fn fragment_id(&self) -> Uuid {
        self.fragment_id
    }

    /// 0-based position within the session.
    pub fn file_sequence(&self) -> u32 {
        self.file_sequence
    }

    /// Where the fragment lives on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written so far, header included.
    pub fn size(&self) -> u64 {
        self.bytes_written
    }

    /// How long the fragment has been open.
    pub fn age(&self, now: OffsetDateTime) -> time::Duration {
        now - self.opened_at
    }

    /// Encodes and appends one packet.
    pub fn append(&mut self, packet: &Packet) -> Result<()> {
        self.scratch.clear();
        self.encoder.encode(packet, &mut self.scratch)?;
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&self.scratch)?;
        self.bytes_written += self.scratch.len() as u64;
        Ok(())
    }

    /// Rewrites the header's updatable region and syncs file data to disk.
    pub fn flush(&mut self, counters: &SessionCounters, now: OffsetDateTime) -> Result<()> {
        header::update_running_state(&mut self.file, counters, now)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Final header update and sync; consumes the fragment.
    pub fn finalize(
        mut self,
        counters: &SessionCounters,
        now: OffsetDateTime,
    ) -> Result<PathBuf> {
        header::update_running_state(&mut self.file, counters, now)?;
        self.file.sync_all()?;
        Ok(self.path)
    }
}

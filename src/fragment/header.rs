//! On-disk fragment header.
//!
//! Layout (all integers little-endian, fixed offsets):
//!
//! ```text
//! 0   magic "GLFA"
//! 4   major u16, 6 minor u16
//! 8   session_id (16 bytes)
//! 24  fragment_id (16 bytes)
//! 40  file_sequence u32
//! 44  status u8          | updatable
//! 45  reserved (3 bytes) |
//! 48  session_start_time i64 nanos
//! 56  end_time i64 nanos          | updatable
//! 64  fragment_start_time i64 nanos
//! 72  fragment_end_time i64 nanos | updatable
//! 80  message/critical/error/warning/info/verbose counts, u64 each | updatable
//! 128 crc32 over bytes 0..128
//! 132 summary_len u32
//! 136 summary blob (summary_len bytes)
//! ```
//!
//! The updatable fields are rewritten in place on every flush and at
//! rotation; everything is fixed-width so the region cannot outgrow its
//! reservation. The summary blob is written once at fragment creation. A
//! header whose status still reads `Running` when opened by another process
//! is a crash candidate.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::packet::{timestamp_from_nanos, timestamp_nanos, wire};
use crate::session::{
    ApplicationType, SessionCounters, SessionStatus, SessionSummary,
};

pub(crate) const GLF_MAGIC: &[u8; 4] = b"GLFA";
pub(crate) const GLF_VERSION_MAJOR: u16 = 2;
pub(crate) const GLF_VERSION_MINOR: u16 = 0;

const FIXED_REGION: usize = 128;
const CRC_OFFSET: usize = 128;
const SUMMARY_LEN_OFFSET: usize = 132;
const SUMMARY_OFFSET: usize = 136;
const MAX_SUMMARY_BYTES: usize = 1 << 20;

const OFF_STATUS: usize = 44;
const OFF_END_TIME: usize = 56;
const OFF_FRAGMENT_END_TIME: usize = 72;
const OFF_COUNTS: usize = 80;

/// In-memory form of a fragment header.
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentHeader {
    /// Session description, identical across the session's fragments.
    pub summary: SessionSummary,
    /// Id of this fragment file.
    pub fragment_id: Uuid,
    /// 0-based position within the session.
    pub file_sequence: u32,
    /// Session status as of the last header flush.
    pub status: SessionStatus,
    /// Session end-time heartbeat as of the last flush.
    pub end_time: OffsetDateTime,
    /// Moment this fragment was opened.
    pub fragment_start_time: OffsetDateTime,
    /// Last activity written to this fragment.
    pub fragment_end_time: OffsetDateTime,
    /// Running counters as of the last flush.
    pub counters: HeaderCounts,
}

/// Severity counters stored in the updatable region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderCounts {
    /// Total messages.
    pub message_count: u64,
    /// Critical messages.
    pub critical_count: u64,
    /// Error messages.
    pub error_count: u64,
    /// Warning messages.
    pub warning_count: u64,
    /// Information messages.
    pub info_count: u64,
    /// Verbose messages.
    pub verbose_count: u64,
}

impl From<&SessionCounters> for HeaderCounts {
    fn from(counters: &SessionCounters) -> Self {
        Self {
            message_count: counters.message_count,
            critical_count: counters.critical_count,
            error_count: counters.error_count,
            warning_count: counters.warning_count,
            info_count: counters.info_count,
            verbose_count: counters.verbose_count,
        }
    }
}

fn encode_summary(summary: &SessionSummary) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    wire::put_uuid(summary.id, &mut out);
    wire::put_str(&summary.product, &mut out);
    wire::put_str(&summary.application, &mut out);
    wire::put_str(&summary.application_version, &mut out);
    wire::put_str(&summary.application_description, &mut out);
    wire::put_str(&summary.environment, &mut out);
    wire::put_str(&summary.promotion_level, &mut out);
    wire::put_str(&summary.agent_version, &mut out);
    wire::put_str(&summary.host_name, &mut out);
    wire::put_str(&summary.user_name, &mut out);
    wire::put_str(&summary.os_description, &mut out);
    wire::put_str(&summary.culture, &mut out);
    out.push(summary.application_type.as_u8());
    wire::put_i64(timestamp_nanos(summary.start_time), &mut out);
    wire::put_u64(summary.properties.len() as u64, &mut out);
    for (key, value) in &summary.properties {
        wire::put_str(key, &mut out);
        wire::put_str(value, &mut out);
    }
    out
}

fn decode_summary(src: &mut impl Read) -> Result<SessionSummary> {
    const LIMIT: usize = MAX_SUMMARY_BYTES;
    let id = wire::get_uuid(src)?;
    let product = wire::get_str(src, LIMIT)?;
    let application = wire::get_str(src, LIMIT)?;
    let application_version = wire::get_str(src, LIMIT)?;
    let application_description = wire::get_str(src, LIMIT)?;
    let environment = wire::get_str(src, LIMIT)?;
    let promotion_level = wire::get_str(src, LIMIT)?;
    let agent_version = wire::get_str(src, LIMIT)?;
    let host_name = wire::get_str(src, LIMIT)?;
    let user_name = wire::get_str(src, LIMIT)?;
    let os_description = wire::get_str(src, LIMIT)?;
    let culture = wire::get_str(src, LIMIT)?;
    let application_type = ApplicationType::from_u8(wire::get_u8(src)?);
    let start_time = timestamp_from_nanos(wire::get_i64(src)?);
    let property_count = wire::get_u64(src)?;
    if property_count > 1 << 16 {
        return Err(AgentError::Corruption(
            "summary property count out of range".into(),
        ));
    }
    let mut properties = std::collections::BTreeMap::new();
    for _ in 0..property_count {
        let key = wire::get_str(src, LIMIT)?;
        let value = wire::get_str(src, LIMIT)?;
        properties.insert(key, value);
    }
    Ok(SessionSummary {
        id,
        product,
        application,
        application_version,
        application_description,
        environment,
        promotion_level,
        agent_version,
        host_name,
        user_name,
        os_description,
        culture,
        application_type,
        start_time,
        properties,
    })
}

fn fill_fixed_region(header: &FragmentHeader, data: &mut [u8]) {
    data[..4].copy_from_slice(GLF_MAGIC);
    data[4..6].copy_from_slice(&GLF_VERSION_MAJOR.to_le_bytes());
    data[6..8].copy_from_slice(&GLF_VERSION_MINOR.to_le_bytes());
    data[8..24].copy_from_slice(header.summary.id.as_bytes());
    data[24..40].copy_from_slice(header.fragment_id.as_bytes());
    data[40..44].copy_from_slice(&header.file_sequence.to_le_bytes());
    data[OFF_STATUS] = header.status.as_u8();
    data[45..48].fill(0);
    data[48..56].copy_from_slice(&timestamp_nanos(header.summary.start_time).to_le_bytes());
    data[OFF_END_TIME..64].copy_from_slice(&timestamp_nanos(header.end_time).to_le_bytes());
    data[64..72].copy_from_slice(&timestamp_nanos(header.fragment_start_time).to_le_bytes());
    data[OFF_FRAGMENT_END_TIME..80]
        .copy_from_slice(&timestamp_nanos(header.fragment_end_time).to_le_bytes());
    let counts = [
        header.counters.message_count,
        header.counters.critical_count,
        header.counters.error_count,
        header.counters.warning_count,
        header.counters.info_count,
        header.counters.verbose_count,
    ];
    for (slot, count) in counts.iter().enumerate() {
        let start = OFF_COUNTS + slot * 8;
        data[start..start + 8].copy_from_slice(&count.to_le_bytes());
    }
}

fn crc_of(fixed: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&fixed[..FIXED_REGION]);
    hasher.finalize()
}

impl FragmentHeader {
    /// Builds the header for a brand-new fragment.
    pub fn new(
        summary: SessionSummary,
        fragment_id: Uuid,
        file_sequence: u32,
        counters: &SessionCounters,
        fragment_start_time: OffsetDateTime,
    ) -> Self {
        Self {
            summary,
            fragment_id,
            file_sequence,
            status: counters.status,
            end_time: timestamp_from_nanos(counters.end_time_nanos),
            fragment_start_time,
            fragment_end_time: fragment_start_time,
            counters: HeaderCounts::from(counters),
        }
    }

    /// Total encoded size of this header in bytes.
    pub fn encoded_len(&self) -> usize {
        SUMMARY_OFFSET + encode_summary(&self.summary).len()
    }

    /// Serializes the complete header (fixed region, CRC, summary blob).
    pub fn encode(&self) -> Result<Vec<u8>> {
        let summary = encode_summary(&self.summary);
        if summary.len() > MAX_SUMMARY_BYTES {
            return Err(AgentError::Serialization(
                "session summary exceeds maximum header size".into(),
            ));
        }
        let mut out = vec![0u8; SUMMARY_OFFSET + summary.len()];
        fill_fixed_region(self, &mut out);
        let crc = crc_of(&out);
        out[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
        out[SUMMARY_LEN_OFFSET..SUMMARY_OFFSET]
            .copy_from_slice(&(summary.len() as u32).to_le_bytes());
        out[SUMMARY_OFFSET..].copy_from_slice(&summary);
        Ok(out)
    }

    /// Reads and validates a header, returning it with the offset where the
    /// packet stream begins.
    pub fn read(src: &mut impl Read) -> Result<(Self, u64)> {
        let mut fixed = [0u8; SUMMARY_OFFSET];
        src.read_exact(&mut fixed).map_err(|_| {
            AgentError::Corruption("fragment shorter than its header".into())
        })?;
        if &fixed[..4] != GLF_MAGIC {
            return Err(AgentError::Corruption("bad fragment magic".into()));
        }
        let major = u16::from_le_bytes([fixed[4], fixed[5]]);
        let minor = u16::from_le_bytes([fixed[6], fixed[7]]);
        if major != GLF_VERSION_MAJOR {
            return Err(AgentError::Corruption(format!(
                "unsupported fragment version {major}.{minor}"
            )));
        }
        let stored_crc = u32::from_le_bytes(
            fixed[CRC_OFFSET..CRC_OFFSET + 4]
                .try_into()
                .expect("slice is 4 bytes"),
        );
        if crc_of(&fixed) != stored_crc {
            return Err(AgentError::Corruption("fragment header checksum mismatch".into()));
        }
        let summary_len = u32::from_le_bytes(
            fixed[SUMMARY_LEN_OFFSET..SUMMARY_OFFSET]
                .try_into()
                .expect("slice is 4 bytes"),
        ) as usize;
        if summary_len > MAX_SUMMARY_BYTES {
            return Err(AgentError::Corruption("summary length out of range".into()));
        }
        let mut summary_buf = vec![0u8; summary_len];
        src.read_exact(&mut summary_buf).map_err(|_| {
            AgentError::Corruption("fragment truncated inside summary".into())
        })?;
        let summary = decode_summary(&mut summary_buf.as_slice())?;

        let read_u64 = |start: usize| {
            u64::from_le_bytes(fixed[start..start + 8].try_into().expect("slice is 8 bytes"))
        };
        let read_i64 = |start: usize| {
            i64::from_le_bytes(fixed[start..start + 8].try_into().expect("slice is 8 bytes"))
        };

        let header = Self {
            summary,
            fragment_id: Uuid::from_bytes(
                fixed[24..40].try_into().expect("slice is 16 bytes"),
            ),
            file_sequence: u32::from_le_bytes(
                fixed[40..44].try_into().expect("slice is 4 bytes"),
            ),
            status: SessionStatus::from_u8(fixed[OFF_STATUS]),
            end_time: timestamp_from_nanos(read_i64(OFF_END_TIME)),
            fragment_start_time: timestamp_from_nanos(read_i64(64)),
            fragment_end_time: timestamp_from_nanos(read_i64(OFF_FRAGMENT_END_TIME)),
            counters: HeaderCounts {
                message_count: read_u64(OFF_COUNTS),
                critical_count: read_u64(OFF_COUNTS + 8),
                error_count: read_u64(OFF_COUNTS + 16),
                warning_count: read_u64(OFF_COUNTS + 24),
                info_count: read_u64(OFF_COUNTS + 32),
                verbose_count: read_u64(OFF_COUNTS + 40),
            },
        };
        Ok((header, (SUMMARY_OFFSET + summary_len) as u64))
    }

    /// True when a later reader should treat the session as a crash
    /// candidate.
    pub fn is_crash_candidate(&self) -> bool {
        self.status == SessionStatus::Running
    }
}

fn patch_fixed_region(
    file: &mut File,
    patch: impl FnOnce(&mut [u8; SUMMARY_OFFSET]),
) -> Result<()> {
    let mut fixed = [0u8; SUMMARY_OFFSET];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut fixed)
        .map_err(|_| AgentError::Corruption("fragment shorter than its header".into()))?;
    if &fixed[..4] != GLF_MAGIC {
        return Err(AgentError::Corruption("bad fragment magic".into()));
    }
    patch(&mut fixed);
    let crc = crc_of(&fixed);
    fixed[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&fixed)?;
    Ok(())
}

/// Rewrites the updatable region in place from fresh session counters.
pub fn update_running_state(
    file: &mut File,
    counters: &SessionCounters,
    fragment_end_time: OffsetDateTime,
) -> Result<()> {
    patch_fixed_region(file, |fixed| {
        fixed[OFF_STATUS] = counters.status.as_u8();
        fixed[OFF_END_TIME..64].copy_from_slice(&counters.end_time_nanos.to_le_bytes());
        fixed[OFF_FRAGMENT_END_TIME..80]
            .copy_from_slice(&timestamp_nanos(fragment_end_time).to_le_bytes());
        let counts = [
            counters.message_count,
            counters.critical_count,
            counters.error_count,
            counters.warning_count,
            counters.info_count,
            counters.verbose_count,
        ];
        for (slot, count) in counts.iter().enumerate() {
            let start = OFF_COUNTS + slot * 8;
            fixed[start..start + 8].copy_from_slice(&count.to_le_bytes());
        }
    })
}

/// Rewrites only the status byte, honoring the monotonic transition rule.
/// Used by crash recovery to convert `Running` headers to `Crashed`.
pub fn patch_status(file: &mut File, status: SessionStatus) -> Result<()> {
    patch_fixed_region(file, |fixed| {
        let current = SessionStatus::from_u8(fixed[OFF_STATUS]);
        fixed[OFF_STATUS] = current.advance(status).as_u8();
    })
}

//! Self-describing packet serialization.
//!
//! Every on-disk record is `varint(body_len)` followed by the body. A body
//! starting with definition id 0 carries a packet definition: the id being
//! defined, the packet type name, a version, and the ordered `(name, type)`
//! field list. Any other id references a previously emitted definition and is
//! followed by the field values in definition order.
//!
//! Definitions are emitted ahead of the first packet that references them
//! within each fragment, so a fragment is readable on its own. Readers decode
//! by the definition, not by compiled-in layout: extra fields of known types
//! are decoded and dropped, and records referencing an unknown definition id
//! or an undecodable definition are skipped with a warning. A hard decode
//! failure aborts the stream and is isolated by the fragment reader.

use std::collections::HashMap;
use std::io::Read;

use tracing::warn;
use uuid::Uuid;

use super::wire;
use super::{
    Command, CommandPacket, EventValueDefinition, EventValueRecord, FragmentInfo, LogMessage,
    MetricDefinitionRecord, Packet, PacketBody, PacketHeader, SampledValueRecord, SampleInterval,
    SamplingKind, SessionClose, ThreadInfo, Trend,
};
use crate::error::{AgentError, Result};
use crate::session::{ApplicationType, SessionStatus, SessionSummary, Severity};

const DEFINITION_RECORD_ID: u64 = 0;
const MAX_RECORD_BYTES: usize = 1 << 24;
const MAX_STRING_BYTES: usize = 1 << 20;
const MAX_LIST_ITEMS: u64 = 1 << 16;

/// Wire field types understood by this agent version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// Single 0/1 byte.
    Bool,
    /// Unsigned LEB128, 32-bit range.
    U32,
    /// Unsigned LEB128.
    U64,
    /// Zigzag LEB128.
    I64,
    /// Little-endian IEEE-754 double.
    F64,
    /// Length-prefixed UTF-8.
    String,
    /// 16 raw bytes.
    Uuid,
    /// Zigzag LEB128 nanoseconds since the unix epoch.
    Timestamp,
    /// Presence byte then a double.
    OptF64,
    /// Presence byte then a string.
    OptString,
    /// Count then doubles.
    F64List,
    /// Count then key/value string pairs.
    StringMap,
    /// Count then (name, unit, trend) triples.
    ValueDefList,
}

impl FieldType {
    fn as_u8(self) -> u8 {
        match self {
            FieldType::Bool => 1,
            FieldType::U32 => 2,
            FieldType::U64 => 3,
            FieldType::I64 => 4,
            FieldType::F64 => 5,
            FieldType::String => 6,
            FieldType::Uuid => 7,
            FieldType::Timestamp => 8,
            FieldType::OptF64 => 9,
            FieldType::OptString => 10,
            FieldType::F64List => 11,
            FieldType::StringMap => 12,
            FieldType::ValueDefList => 13,
        }
    }

    fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => FieldType::Bool,
            2 => FieldType::U32,
            3 => FieldType::U64,
            4 => FieldType::I64,
            5 => FieldType::F64,
            6 => FieldType::String,
            7 => FieldType::Uuid,
            8 => FieldType::Timestamp,
            9 => FieldType::OptF64,
            10 => FieldType::OptString,
            11 => FieldType::F64List,
            12 => FieldType::StringMap,
            13 => FieldType::ValueDefList,
            _ => return None,
        })
    }
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq)]
enum FieldValue {
    Bool(bool),
    U32(u32),
    U64(u64),
    I64(i64),
    F64(f64),
    Str(String),
    Uuid(Uuid),
    Timestamp(i64),
    OptF64(Option<f64>),
    OptStr(Option<String>),
    F64List(Vec<f64>),
    StringMap(Vec<(String, String)>),
    ValueDefs(Vec<EventValueDefinition>),
}

impl FieldValue {
    fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Bool(_) => FieldType::Bool,
            FieldValue::U32(_) => FieldType::U32,
            FieldValue::U64(_) => FieldType::U64,
            FieldValue::I64(_) => FieldType::I64,
            FieldValue::F64(_) => FieldType::F64,
            FieldValue::Str(_) => FieldType::String,
            FieldValue::Uuid(_) => FieldType::Uuid,
            FieldValue::Timestamp(_) => FieldType::Timestamp,
            FieldValue::OptF64(_) => FieldType::OptF64,
            FieldValue::OptStr(_) => FieldType::OptString,
            FieldValue::F64List(_) => FieldType::F64List,
            FieldValue::StringMap(_) => FieldType::StringMap,
            FieldValue::ValueDefs(_) => FieldType::ValueDefList,
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        match self {
            FieldValue::Bool(v) => out.push(u8::from(*v)),
            FieldValue::U32(v) => wire::put_u64(u64::from(*v), out),
            FieldValue::U64(v) => wire::put_u64(*v, out),
            FieldValue::I64(v) => wire::put_i64(*v, out),
            FieldValue::F64(v) => wire::put_f64(*v, out),
            FieldValue::Str(v) => wire::put_str(v, out),
            FieldValue::Uuid(v) => wire::put_uuid(*v, out),
            FieldValue::Timestamp(v) => wire::put_i64(*v, out),
            FieldValue::OptF64(v) => {
                out.push(u8::from(v.is_some()));
                if let Some(v) = v {
                    wire::put_f64(*v, out);
                }
            }
            FieldValue::OptStr(v) => {
                out.push(u8::from(v.is_some()));
                if let Some(v) = v {
                    wire::put_str(v, out);
                }
            }
            FieldValue::F64List(items) => {
                wire::put_u64(items.len() as u64, out);
                for item in items {
                    wire::put_f64(*item, out);
                }
            }
            FieldValue::StringMap(pairs) => {
                wire::put_u64(pairs.len() as u64, out);
                for (key, value) in pairs {
                    wire::put_str(key, out);
                    wire::put_str(value, out);
                }
            }
            FieldValue::ValueDefs(defs) => {
                wire::put_u64(defs.len() as u64, out);
                for def in defs {
                    wire::put_str(&def.name, out);
                    wire::put_str(&def.unit_caption, out);
                    out.push(def.default_trend.as_u8());
                }
            }
        }
    }

    fn read(ftype: FieldType, src: &mut impl Read) -> Result<Self> {
        Ok(match ftype {
            FieldType::Bool => FieldValue::Bool(wire::get_u8(src)? != 0),
            FieldType::U32 => {
                let raw = wire::get_u64(src)?;
                let narrowed = u32::try_from(raw).map_err(|_| {
                    AgentError::Corruption("u32 field exceeds 32 bits".into())
                })?;
                FieldValue::U32(narrowed)
            }
            FieldType::U64 => FieldValue::U64(wire::get_u64(src)?),
            FieldType::I64 => FieldValue::I64(wire::get_i64(src)?),
            FieldType::F64 => FieldValue::F64(wire::get_f64(src)?),
            FieldType::String => FieldValue::Str(wire::get_str(src, MAX_STRING_BYTES)?),
            FieldType::Uuid => FieldValue::Uuid(wire::get_uuid(src)?),
            FieldType::Timestamp => FieldValue::Timestamp(wire::get_i64(src)?),
            FieldType::OptF64 => {
                if wire::get_u8(src)? != 0 {
                    FieldValue::OptF64(Some(wire::get_f64(src)?))
                } else {
                    FieldValue::OptF64(None)
                }
            }
            FieldType::OptString => {
                if wire::get_u8(src)? != 0 {
                    FieldValue::OptStr(Some(wire::get_str(src, MAX_STRING_BYTES)?))
                } else {
                    FieldValue::OptStr(None)
                }
            }
            FieldType::F64List => {
                let count = wire::get_u64(src)?;
                if count > MAX_LIST_ITEMS {
                    return Err(AgentError::Corruption("list length out of range".into()));
                }
                let mut items = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    items.push(wire::get_f64(src)?);
                }
                FieldValue::F64List(items)
            }
            FieldType::StringMap => {
                let count = wire::get_u64(src)?;
                if count > MAX_LIST_ITEMS {
                    return Err(AgentError::Corruption("map length out of range".into()));
                }
                let mut pairs = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let key = wire::get_str(src, MAX_STRING_BYTES)?;
                    let value = wire::get_str(src, MAX_STRING_BYTES)?;
                    pairs.push((key, value));
                }
                FieldValue::StringMap(pairs)
            }
            FieldType::ValueDefList => {
                let count = wire::get_u64(src)?;
                if count > MAX_LIST_ITEMS {
                    return Err(AgentError::Corruption("list length out of range".into()));
                }
                let mut defs = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let name = wire::get_str(src, MAX_STRING_BYTES)?;
                    let unit_caption = wire::get_str(src, MAX_STRING_BYTES)?;
                    let trend_byte = wire::get_u8(src)?;
                    let default_trend = Trend::from_u8(trend_byte).ok_or_else(|| {
                        AgentError::Corruption(format!("unrecognized trend byte {trend_byte}"))
                    })?;
                    defs.push(EventValueDefinition {
                        name,
                        unit_caption,
                        default_trend,
                    });
                }
                FieldValue::ValueDefs(defs)
            }
        })
    }
}

/// One named, typed field slot of a packet definition.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    /// Field name, stable across versions.
    pub name: String,
    /// Wire type.
    pub field_type: FieldType,
}

/// A registered packet layout: `(type name, version)` plus ordered fields.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketDefinition {
    /// Id the stream references this definition by.
    pub id: u32,
    /// Packet type name.
    pub type_name: String,
    /// Layout version of the type.
    pub version: u16,
    /// Ordered field slots.
    pub fields: Vec<FieldDef>,
}

fn field_values(packet: &Packet) -> Vec<(&'static str, FieldValue)> {
    let header = &packet.header;
    let mut fields = vec![
        ("sequence", FieldValue::U64(header.sequence)),
        (
            "timestamp",
            FieldValue::Timestamp(super::timestamp_nanos(header.timestamp)),
        ),
        ("thread_index", FieldValue::U32(header.thread_index)),
        ("thread_id", FieldValue::U64(header.thread_id)),
    ];
    match &packet.body {
        PacketBody::Log(log) => {
            fields.push(("severity", FieldValue::U32(u32::from(log.severity.as_u8()))));
            fields.push(("log_system", FieldValue::Str(log.log_system.clone())));
            fields.push(("category", FieldValue::Str(log.category.clone())));
            fields.push(("caption", FieldValue::Str(log.normalized_caption().to_owned())));
            fields.push(("description", FieldValue::Str(log.description.clone())));
            fields.push(("details_xml", FieldValue::OptStr(log.details_xml.clone())));
            let (exc_type, exc_message, exc_stack) = match &log.exception {
                Some(exc) => (
                    Some(exc.type_name.clone()),
                    Some(exc.message.clone()),
                    exc.stack_trace.clone(),
                ),
                None => (None, None, None),
            };
            fields.push(("exception_type", FieldValue::OptStr(exc_type)));
            fields.push(("exception_message", FieldValue::OptStr(exc_message)));
            fields.push(("exception_stack", FieldValue::OptStr(exc_stack)));
            let source = log.source.clone().unwrap_or_default();
            fields.push((
                "source_class",
                FieldValue::OptStr(log.source.as_ref().map(|_| source.class_name.clone())),
            ));
            fields.push((
                "source_method",
                FieldValue::OptStr(log.source.as_ref().map(|_| source.method_name.clone())),
            ));
            fields.push((
                "source_file",
                FieldValue::OptStr(log.source.as_ref().map(|_| source.file_name.clone())),
            ));
            fields.push(("source_line", FieldValue::U32(source.line_number)));
            fields.push(("user_name", FieldValue::OptStr(log.user_name.clone())));
            fields.push((
                "user_principal",
                FieldValue::OptStr(log.user_principal.clone()),
            ));
        }
        PacketBody::ThreadInfo(info) => {
            fields.push(("registered_index", FieldValue::U32(info.thread_index)));
            fields.push(("registered_id", FieldValue::U64(info.thread_id)));
            fields.push(("caption", FieldValue::Str(info.caption.clone())));
        }
        PacketBody::MetricDefinition(def) => {
            fields.push(("definition_id", FieldValue::Uuid(def.id)));
            fields.push(("metric_type", FieldValue::Str(def.metric_type_name.clone())));
            fields.push(("category", FieldValue::Str(def.category.clone())));
            fields.push(("counter", FieldValue::Str(def.counter.clone())));
            fields.push(("is_event", FieldValue::Bool(def.is_event)));
            fields.push((
                "sampling_kind",
                FieldValue::U32(u32::from(def.sampling_kind.as_u8())),
            ));
            fields.push(("interval", FieldValue::U32(u32::from(def.interval.as_u8()))));
            fields.push(("unit_caption", FieldValue::Str(def.unit_caption.clone())));
            fields.push((
                "bound_type",
                FieldValue::OptStr(def.bound_type_name.clone()),
            ));
            fields.push((
                "name_member",
                FieldValue::OptStr(def.name_member_name.clone()),
            ));
            fields.push(("event_values", FieldValue::ValueDefs(def.event_values.clone())));
        }
        PacketBody::SampledValue(sample) => {
            fields.push(("metric_id", FieldValue::Uuid(sample.metric_id)));
            fields.push(("definition_id", FieldValue::Uuid(sample.definition_id)));
            fields.push(("raw_value", FieldValue::F64(sample.raw_value)));
            fields.push(("base_value", FieldValue::OptF64(sample.base_value)));
            fields.push((
                "raw_timestamp",
                FieldValue::Timestamp(super::timestamp_nanos(sample.raw_timestamp)),
            ));
            fields.push((
                "sample_timestamp",
                FieldValue::Timestamp(super::timestamp_nanos(sample.sample_timestamp)),
            ));
            fields.push((
                "sampling_kind",
                FieldValue::U32(u32::from(sample.sampling_kind.as_u8())),
            ));
        }
        PacketBody::EventValue(event) => {
            fields.push(("metric_id", FieldValue::Uuid(event.metric_id)));
            fields.push(("definition_id", FieldValue::Uuid(event.definition_id)));
            fields.push(("values", FieldValue::F64List(event.values.clone())));
            fields.push((
                "event_timestamp",
                FieldValue::Timestamp(super::timestamp_nanos(event.event_timestamp)),
            ));
        }
        PacketBody::SessionInfo(summary) => {
            fields.push(("session_id", FieldValue::Uuid(summary.id)));
            fields.push(("product", FieldValue::Str(summary.product.clone())));
            fields.push(("application", FieldValue::Str(summary.application.clone())));
            fields.push((
                "application_version",
                FieldValue::Str(summary.application_version.clone()),
            ));
            fields.push((
                "application_description",
                FieldValue::Str(summary.application_description.clone()),
            ));
            fields.push(("environment", FieldValue::Str(summary.environment.clone())));
            fields.push((
                "promotion_level",
                FieldValue::Str(summary.promotion_level.clone()),
            ));
            fields.push((
                "agent_version",
                FieldValue::Str(summary.agent_version.clone()),
            ));
            fields.push(("host_name", FieldValue::Str(summary.host_name.clone())));
            fields.push(("user_name", FieldValue::Str(summary.user_name.clone())));
            fields.push((
                "os_description",
                FieldValue::Str(summary.os_description.clone()),
            ));
            fields.push(("culture", FieldValue::Str(summary.culture.clone())));
            fields.push((
                "application_type",
                FieldValue::U32(u32::from(summary.application_type.as_u8())),
            ));
            fields.push((
                "start_time",
                FieldValue::Timestamp(super::timestamp_nanos(summary.start_time)),
            ));
            fields.push((
                "properties",
                FieldValue::StringMap(
                    summary
                        .properties
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                ),
            ));
        }
        PacketBody::FragmentInfo(info) => {
            fields.push(("fragment_id", FieldValue::Uuid(info.fragment_id)));
            fields.push(("file_sequence", FieldValue::U32(info.file_sequence)));
            fields.push((
                "fragment_start_time",
                FieldValue::Timestamp(super::timestamp_nanos(info.fragment_start_time)),
            ));
        }
        PacketBody::SessionClose(close) => {
            fields.push(("status", FieldValue::U32(u32::from(close.status.as_u8()))));
            fields.push(("reason", FieldValue::Str(close.reason.clone())));
        }
        PacketBody::Command(command) => {
            let (code, status) = match command.command {
                Command::CloseFile => (0u32, 0u32),
                Command::ExitMode(status) => (1u32, u32::from(status.as_u8())),
            };
            fields.push(("command", FieldValue::U32(code)));
            fields.push(("exit_status", FieldValue::U32(status)));
            fields.push(("reason", FieldValue::Str(command.reason.clone())));
        }
    }
    fields
}

/// Encodes packets, emitting each type's definition ahead of its first use.
///
/// One encoder lives per fragment; `reset` forgets emitted definitions so the
/// next fragment is self-contained.
#[derive(Debug, Default)]
pub struct PacketEncoder {
    assigned: HashMap<&'static str, u32>,
    next_id: u32,
}

impl PacketEncoder {
    /// A fresh encoder with no emitted definitions.
    pub fn new() -> Self {
        Self {
            assigned: HashMap::new(),
            next_id: 1,
        }
    }

    /// Forgets emitted definitions; used at fragment rotation.
    pub fn reset(&mut self) {
        self.assigned.clear();
        self.next_id = 1;
    }

    /// Appends the encoded record (and its definition when first seen) to
    /// `out`.
    pub fn encode(&mut self, packet: &Packet, out: &mut Vec<u8>) -> Result<()> {
        let type_name = packet.body.type_name();
        let values = field_values(packet);
        let def_id = match self.assigned.get(type_name) {
            Some(id) => *id,
            None => {
                let id = self.next_id;
                self.next_id += 1;
                self.assigned.insert(type_name, id);
                let mut body = Vec::with_capacity(64);
                wire::put_u64(DEFINITION_RECORD_ID, &mut body);
                wire::put_u64(u64::from(id), &mut body);
                wire::put_str(type_name, &mut body);
                wire::put_u64(1, &mut body); // layout version
                wire::put_u64(values.len() as u64, &mut body);
                for (name, value) in &values {
                    wire::put_str(name, &mut body);
                    body.push(value.field_type().as_u8());
                }
                wire::put_u64(body.len() as u64, out);
                out.extend_from_slice(&body);
                id
            }
        };

        let mut body = Vec::with_capacity(128);
        wire::put_u64(u64::from(def_id), &mut body);
        for (_, value) in &values {
            value.write(&mut body);
        }
        wire::put_u64(body.len() as u64, out);
        out.extend_from_slice(&body);
        Ok(())
    }
}

#[derive(Debug)]
enum StoredDefinition {
    Known(PacketDefinition),
    // A definition whose field types this agent cannot decode; its packets
    // are skipped rather than failing the stream.
    Opaque { type_name: String },
}

/// Collected fields of one decoded record, queried by name.
struct Fields {
    entries: Vec<(String, FieldValue)>,
}

impl Fields {
    fn take(&self, name: &str) -> Option<&FieldValue> {
        self.entries
            .iter()
            .find(|(entry_name, _)| entry_name == name)
            .map(|(_, value)| value)
    }

    fn str(&self, name: &str) -> String {
        match self.take(name) {
            Some(FieldValue::Str(v)) => v.clone(),
            _ => String::new(),
        }
    }

    fn opt_str(&self, name: &str) -> Option<String> {
        match self.take(name) {
            Some(FieldValue::OptStr(v)) => v.clone(),
            _ => None,
        }
    }

    fn u32(&self, name: &str) -> u32 {
        match self.take(name) {
            Some(FieldValue::U32(v)) => *v,
            _ => 0,
        }
    }

    fn u64(&self, name: &str) -> u64 {
        match self.take(name) {
            Some(FieldValue::U64(v)) => *v,
            _ => 0,
        }
    }

    fn f64(&self, name: &str) -> f64 {
        match self.take(name) {
            Some(FieldValue::F64(v)) => *v,
            _ => 0.0,
        }
    }

    fn opt_f64(&self, name: &str) -> Option<f64> {
        match self.take(name) {
            Some(FieldValue::OptF64(v)) => *v,
            _ => None,
        }
    }

    fn bool(&self, name: &str) -> bool {
        match self.take(name) {
            Some(FieldValue::Bool(v)) => *v,
            _ => false,
        }
    }

    fn uuid(&self, name: &str) -> Result<Uuid> {
        match self.take(name) {
            Some(FieldValue::Uuid(v)) => Ok(*v),
            _ => Err(AgentError::Corruption(format!("missing uuid field {name}"))),
        }
    }

    fn timestamp(&self, name: &str) -> time::OffsetDateTime {
        match self.take(name) {
            Some(FieldValue::Timestamp(nanos)) => super::timestamp_from_nanos(*nanos),
            _ => time::OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn f64_list(&self, name: &str) -> Vec<f64> {
        match self.take(name) {
            Some(FieldValue::F64List(v)) => v.clone(),
            _ => Vec::new(),
        }
    }

    fn string_map(&self, name: &str) -> Vec<(String, String)> {
        match self.take(name) {
            Some(FieldValue::StringMap(v)) => v.clone(),
            _ => Vec::new(),
        }
    }

    fn value_defs(&self, name: &str) -> Vec<EventValueDefinition> {
        match self.take(name) {
            Some(FieldValue::ValueDefs(v)) => v.clone(),
            _ => Vec::new(),
        }
    }
}

/// Streaming decoder over one fragment's packet region.
pub struct PacketDecoder<R: Read> {
    src: R,
    definitions: HashMap<u32, StoredDefinition>,
    warned_ids: Vec<u32>,
}

impl<R: Read> PacketDecoder<R> {
    /// Wraps a reader positioned at the first record.
    pub fn new(src: R) -> Self {
        Self {
            src,
            definitions: HashMap::new(),
            warned_ids: Vec::new(),
        }
    }

    /// Decodes the next packet, skipping definition records and unknown
    /// packet types. Returns `Ok(None)` at a clean end of stream; any error
    /// means the remainder of the stream is unreadable.
    pub fn next_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            let len = match self.read_record_len()? {
                Some(len) => len,
                None => return Ok(None),
            };
            if len > MAX_RECORD_BYTES {
                return Err(AgentError::Corruption(format!(
                    "record length {len} out of range"
                )));
            }
            let mut body = vec![0u8; len];
            self.src.read_exact(&mut body).map_err(|_| {
                AgentError::Corruption("record truncated mid-body".into())
            })?;
            let mut cursor = body.as_slice();
            let def_id = wire::get_u64(&mut cursor)?;
            if def_id == DEFINITION_RECORD_ID {
                self.register_definition(&mut cursor)?;
                continue;
            }
            let def_id = u32::try_from(def_id)
                .map_err(|_| AgentError::Corruption("definition id out of range".into()))?;
            let definition = match self.definitions.get(&def_id) {
                Some(StoredDefinition::Known(def)) => def,
                Some(StoredDefinition::Opaque { type_name }) => {
                    warn_skipped(&mut self.warned_ids, def_id, type_name);
                    continue;
                }
                None => {
                    warn_skipped(&mut self.warned_ids, def_id, "<undeclared>");
                    continue;
                }
            };
            let mut entries = Vec::with_capacity(definition.fields.len());
            for field in &definition.fields {
                let value = FieldValue::read(field.field_type, &mut cursor)?;
                entries.push((field.name.clone(), value));
            }
            // Trailing bytes belong to fields newer than this definition
            // version; the length prefix lets us drop them.
            let fields = Fields { entries };
            match build_packet(&definition.type_name, &fields)? {
                Some(packet) => return Ok(Some(packet)),
                None => {
                    warn_skipped(&mut self.warned_ids, def_id, &definition.type_name);
                    continue;
                }
            }
        }
    }

    /// Drains the remaining stream, returning the decoded packets.
    pub fn collect_packets(&mut self) -> Result<Vec<Packet>> {
        let mut packets = Vec::new();
        while let Some(packet) = self.next_packet()? {
            packets.push(packet);
        }
        Ok(packets)
    }

    // None at a clean record boundary, error on a partial length prefix.
    fn read_record_len(&mut self) -> Result<Option<usize>> {
        let mut first = [0u8; 1];
        match self.src.read(&mut first) {
            Ok(0) => return Ok(None),
            Ok(_) => {}
            Err(err) => return Err(err.into()),
        }
        let mut result = u64::from(first[0] & 0x7f);
        let mut shift = 7u32;
        let mut byte = first[0];
        while byte & 0x80 != 0 {
            byte = wire::get_u8(&mut self.src).map_err(|_| {
                AgentError::Corruption("record truncated mid-length".into())
            })?;
            result |= u64::from(byte & 0x7f) << shift;
            shift += 7;
            if shift > 63 {
                return Err(AgentError::Corruption("record length varint overflow".into()));
            }
        }
        Ok(Some(result as usize))
    }

    fn register_definition(&mut self, cursor: &mut &[u8]) -> Result<()> {
        let id = u32::try_from(wire::get_u64(cursor)?)
            .map_err(|_| AgentError::Corruption("definition id out of range".into()))?;
        if id == 0 {
            return Err(AgentError::Corruption("definition id 0 is reserved".into()));
        }
        let type_name = wire::get_str(cursor, MAX_STRING_BYTES)?;
        let version = u16::try_from(wire::get_u64(cursor)?)
            .map_err(|_| AgentError::Corruption("definition version out of range".into()))?;
        let field_count = wire::get_u64(cursor)?;
        if field_count > MAX_LIST_ITEMS {
            return Err(AgentError::Corruption("definition field count out of range".into()));
        }
        let mut fields = Vec::with_capacity(field_count as usize);
        let mut decodable = true;
        for _ in 0..field_count {
            let name = wire::get_str(cursor, MAX_STRING_BYTES)?;
            let type_byte = wire::get_u8(cursor)?;
            match FieldType::from_u8(type_byte) {
                Some(field_type) => fields.push(FieldDef { name, field_type }),
                None => {
                    decodable = false;
                    break;
                }
            }
        }
        let stored = if decodable {
            StoredDefinition::Known(PacketDefinition {
                id,
                type_name,
                version,
                fields,
            })
        } else {
            warn!(def_id = id, %type_name, "codec.decode.opaque_definition");
            StoredDefinition::Opaque { type_name }
        };
        self.definitions.insert(id, stored);
        Ok(())
    }
}

fn warn_skipped(warned_ids: &mut Vec<u32>, def_id: u32, type_name: &str) {
    if !warned_ids.contains(&def_id) {
        warned_ids.push(def_id);
        warn!(def_id, type_name, "codec.decode.unknown_packet_skipped");
    }
}

fn header_from(fields: &Fields) -> PacketHeader {
    PacketHeader {
        sequence: fields.u64("sequence"),
        timestamp: fields.timestamp("timestamp"),
        thread_index: fields.u32("thread_index"),
        thread_id: fields.u64("thread_id"),
    }
}

fn build_packet(type_name: &str, fields: &Fields) -> Result<Option<Packet>> {
    let header = header_from(fields);
    let body = match type_name {
        "Log.Message" => {
            let severity_byte = u8::try_from(fields.u32("severity")).unwrap_or(0);
            let severity = Severity::from_u8(severity_byte)?;
            let exception = fields.opt_str("exception_type").map(|type_name| {
                super::ExceptionInfo {
                    type_name,
                    message: fields.opt_str("exception_message").unwrap_or_default(),
                    stack_trace: fields.opt_str("exception_stack"),
                }
            });
            let source = fields.opt_str("source_class").map(|class_name| {
                super::SourceLocation {
                    class_name,
                    method_name: fields.opt_str("source_method").unwrap_or_default(),
                    file_name: fields.opt_str("source_file").unwrap_or_default(),
                    line_number: fields.u32("source_line"),
                }
            });
            PacketBody::Log(LogMessage {
                severity,
                log_system: fields.str("log_system"),
                category: fields.str("category"),
                caption: fields.str("caption"),
                description: fields.str("description"),
                details_xml: fields.opt_str("details_xml"),
                exception,
                source,
                user_name: fields.opt_str("user_name"),
                user_principal: fields.opt_str("user_principal"),
            })
        }
        "Session.ThreadInfo" => PacketBody::ThreadInfo(ThreadInfo {
            thread_index: fields.u32("registered_index"),
            thread_id: fields.u64("registered_id"),
            caption: fields.str("caption"),
        }),
        "Metric.Definition" => {
            let kind_byte = u8::try_from(fields.u32("sampling_kind")).unwrap_or(u8::MAX);
            let sampling_kind = SamplingKind::from_u8(kind_byte).ok_or_else(|| {
                AgentError::Corruption(format!("unrecognized sampling kind {kind_byte}"))
            })?;
            let interval_byte = u8::try_from(fields.u32("interval")).unwrap_or(u8::MAX);
            let interval = SampleInterval::from_u8(interval_byte).ok_or_else(|| {
                AgentError::Corruption(format!("unrecognized sample interval {interval_byte}"))
            })?;
            PacketBody::MetricDefinition(MetricDefinitionRecord {
                id: fields.uuid("definition_id")?,
                metric_type_name: fields.str("metric_type"),
                category: fields.str("category"),
                counter: fields.str("counter"),
                is_event: fields.bool("is_event"),
                sampling_kind,
                interval,
                unit_caption: fields.str("unit_caption"),
                bound_type_name: fields.opt_str("bound_type"),
                name_member_name: fields.opt_str("name_member"),
                event_values: fields.value_defs("event_values"),
            })
        }
        "Metric.SampledValue" => {
            let kind_byte = u8::try_from(fields.u32("sampling_kind")).unwrap_or(u8::MAX);
            let sampling_kind = SamplingKind::from_u8(kind_byte).ok_or_else(|| {
                AgentError::Corruption(format!("unrecognized sampling kind {kind_byte}"))
            })?;
            PacketBody::SampledValue(SampledValueRecord {
                metric_id: fields.uuid("metric_id")?,
                definition_id: fields.uuid("definition_id")?,
                raw_value: fields.f64("raw_value"),
                base_value: fields.opt_f64("base_value"),
                raw_timestamp: fields.timestamp("raw_timestamp"),
                sample_timestamp: fields.timestamp("sample_timestamp"),
                sampling_kind,
            })
        }
        "Metric.EventValue" => PacketBody::EventValue(EventValueRecord {
            metric_id: fields.uuid("metric_id")?,
            definition_id: fields.uuid("definition_id")?,
            values: fields.f64_list("values"),
            event_timestamp: fields.timestamp("event_timestamp"),
        }),
        "Session.Info" => {
            let properties = fields
                .string_map("properties")
                .into_iter()
                .collect::<std::collections::BTreeMap<_, _>>();
            PacketBody::SessionInfo(SessionSummary {
                id: fields.uuid("session_id")?,
                product: fields.str("product"),
                application: fields.str("application"),
                application_version: fields.str("application_version"),
                application_description: fields.str("application_description"),
                environment: fields.str("environment"),
                promotion_level: fields.str("promotion_level"),
                agent_version: fields.str("agent_version"),
                host_name: fields.str("host_name"),
                user_name: fields.str("user_name"),
                os_description: fields.str("os_description"),
                culture: fields.str("culture"),
                application_type: ApplicationType::from_u8(
                    u8::try_from(fields.u32("application_type")).unwrap_or(0),
                ),
                start_time: fields.timestamp("start_time"),
                properties,
            })
        }
        "Session.FragmentInfo" => PacketBody::FragmentInfo(FragmentInfo {
            fragment_id: fields.uuid("fragment_id")?,
            file_sequence: fields.u32("file_sequence"),
            fragment_start_time: fields.timestamp("fragment_start_time"),
        }),
        "Session.Close" => PacketBody::SessionClose(SessionClose {
            status: SessionStatus::from_u8(u8::try_from(fields.u32("status")).unwrap_or(0)),
            reason: fields.str("reason"),
        }),
        "Session.Command" => {
            let command = match fields.u32("command") {
                0 => Command::CloseFile,
                1 => Command::ExitMode(SessionStatus::from_u8(
                    u8::try_from(fields.u32("exit_status")).unwrap_or(0),
                )),
                _ => return Ok(None),
            };
            PacketBody::Command(CommandPacket {
                command,
                reason: fields.str("reason"),
            })
        }
        _ => return Ok(None),
    };
    Ok(Some(Packet { header, body }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ExceptionInfo, SourceLocation};
    use time::macros::datetime;

    fn stamped(body: PacketBody) -> Packet {
        Packet {
            header: PacketHeader {
                sequence: 7,
                timestamp: datetime!(2024-05-01 12:00:00 UTC),
                thread_index: 2,
                thread_id: 4242,
            },
            body,
        }
    }

    fn round_trip(packets: Vec<Packet>) -> Vec<Packet> {
        let mut encoder = PacketEncoder::new();
        let mut buf = Vec::new();
        for packet in &packets {
            encoder.encode(packet, &mut buf).unwrap();
        }
        let mut decoder = PacketDecoder::new(buf.as_slice());
        decoder.collect_packets().unwrap()
    }

    #[test]
    fn log_message_round_trips_with_all_fields() {
        let mut log = LogMessage::new(Severity::Error, "db.pool", "connection refused\ndetail");
        log.details_xml = Some("<details/>".into());
        log.exception = Some(ExceptionInfo {
            type_name: "IoError".into(),
            message: "refused".into(),
            stack_trace: Some("frame0\nframe1".into()),
        });
        log.source = Some(SourceLocation {
            class_name: "Pool".into(),
            method_name: "connect".into(),
            file_name: "pool.rs".into(),
            line_number: 42,
        });
        log.user_name = Some("alice".into());
        let decoded = round_trip(vec![stamped(PacketBody::Log(log.clone()))]);
        assert_eq!(decoded.len(), 1);
        let PacketBody::Log(out) = &decoded[0].body else {
            panic!("expected log packet");
        };
        assert_eq!(out.caption, "connection refused");
        assert_eq!(out.exception, log.exception);
        assert_eq!(out.source, log.source);
        assert_eq!(out.user_name, log.user_name);
        assert_eq!(decoded[0].header.sequence, 7);
        assert_eq!(decoded[0].header.thread_index, 2);
    }

    #[test]
    fn definitions_are_emitted_once_per_type() {
        let mut encoder = PacketEncoder::new();
        let mut buf_one = Vec::new();
        let packet = stamped(PacketBody::SessionClose(SessionClose {
            status: SessionStatus::Normal,
            reason: "bye".into(),
        }));
        encoder.encode(&packet, &mut buf_one).unwrap();
        let mut buf_two = Vec::new();
        encoder.encode(&packet, &mut buf_two).unwrap();
        assert!(buf_two.len() < buf_one.len());
    }

    #[test]
    fn reset_re_emits_definitions() {
        let mut encoder = PacketEncoder::new();
        let packet = stamped(PacketBody::SessionClose(SessionClose {
            status: SessionStatus::Normal,
            reason: "bye".into(),
        }));
        let mut first = Vec::new();
        encoder.encode(&packet, &mut first).unwrap();
        encoder.reset();
        let mut second = Vec::new();
        encoder.encode(&packet, &mut second).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn unknown_definition_id_is_skipped() {
        let packet = stamped(PacketBody::SessionClose(SessionClose {
            status: SessionStatus::Normal,
            reason: "bye".into(),
        }));
        let mut encoder = PacketEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&packet, &mut buf).unwrap();
        // A record referencing definition id 9 that was never declared.
        let mut rogue_body = Vec::new();
        wire::put_u64(9, &mut rogue_body);
        wire::put_u64(123, &mut rogue_body);
        let mut rogue = Vec::new();
        wire::put_u64(rogue_body.len() as u64, &mut rogue);
        rogue.extend_from_slice(&rogue_body);
        let combined = [buf, rogue].concat();
        let mut decoder = PacketDecoder::new(combined.as_slice());
        let packets = decoder.collect_packets().unwrap();
        assert_eq!(packets.len(), 1);
    }

    #[test]
    fn trailing_unknown_fields_are_dropped() {
        // Encode a close packet, then extend its record with extra bytes the
        // definition does not describe; the length prefix covers them.
        let packet = stamped(PacketBody::SessionClose(SessionClose {
            status: SessionStatus::Normal,
            reason: "bye".into(),
        }));
        let values = field_values(&packet);
        let mut body = Vec::new();
        // Definition with one extra trailing field the decoder knows the
        // type of but not the name.
        let mut def_body = Vec::new();
        wire::put_u64(DEFINITION_RECORD_ID, &mut def_body);
        wire::put_u64(1, &mut def_body);
        wire::put_str("Session.Close", &mut def_body);
        wire::put_u64(1, &mut def_body);
        wire::put_u64(values.len() as u64 + 1, &mut def_body);
        for (name, value) in &values {
            wire::put_str(name, &mut def_body);
            def_body.push(value.field_type().as_u8());
        }
        wire::put_str("future_field", &mut def_body);
        def_body.push(FieldType::U64.as_u8());
        wire::put_u64(def_body.len() as u64, &mut body);
        body.extend_from_slice(&def_body);

        let mut rec_body = Vec::new();
        wire::put_u64(1, &mut rec_body);
        for (_, value) in &values {
            value.write(&mut rec_body);
        }
        wire::put_u64(777, &mut rec_body); // future_field payload
        wire::put_u64(rec_body.len() as u64, &mut body);
        body.extend_from_slice(&rec_body);

        let mut decoder = PacketDecoder::new(body.as_slice());
        let packets = decoder.collect_packets().unwrap();
        assert_eq!(packets.len(), 1);
        assert!(matches!(packets[0].body, PacketBody::SessionClose(_)));
    }

    #[test]
    fn truncated_record_fails_decode() {
        let packet = stamped(PacketBody::SessionClose(SessionClose {
            status: SessionStatus::Normal,
            reason: "a reasonably long reason string".into(),
        }));
        let mut encoder = PacketEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&packet, &mut buf).unwrap();
        buf.truncate(buf.len() - 5);
        let mut decoder = PacketDecoder::new(buf.as_slice());
        assert!(decoder.collect_packets().is_err());
    }

    #[test]
    fn every_packet_type_round_trips() {
        let summary = SessionSummary {
            id: Uuid::new_v4(),
            product: "TestP".into(),
            application: "TestA".into(),
            application_version: "1.0".into(),
            application_description: "desc".into(),
            environment: "dev".into(),
            promotion_level: "qa".into(),
            agent_version: "0.3.0".into(),
            host_name: "host".into(),
            user_name: "user".into(),
            os_description: "linux".into(),
            culture: "en-US".into(),
            application_type: ApplicationType::Service,
            start_time: datetime!(2024-05-01 08:00:00 UTC),
            properties: std::collections::BTreeMap::from([(
                "region".to_string(),
                "eu".to_string(),
            )]),
        };
        let definition_id = Uuid::new_v4();
        let mut log = LogMessage::new(Severity::Critical, "cat", "boom");
        log.caption = "boom".into();
        let bodies = vec![
            PacketBody::Log(log),
            PacketBody::ThreadInfo(ThreadInfo {
                thread_index: 3,
                thread_id: 99,
                caption: "worker".into(),
            }),
            PacketBody::MetricDefinition(MetricDefinitionRecord {
                id: definition_id,
                metric_type_name: "app".into(),
                category: "Requests".into(),
                counter: "latency".into(),
                is_event: true,
                sampling_kind: SamplingKind::NumberOfItems,
                interval: SampleInterval::Second,
                unit_caption: String::new(),
                bound_type_name: Some("Request".into()),
                name_member_name: Some("route".into()),
                event_values: vec![EventValueDefinition {
                    name: "duration".into(),
                    unit_caption: "ms".into(),
                    default_trend: Trend::Average,
                }],
            }),
            PacketBody::SampledValue(SampledValueRecord {
                metric_id: Uuid::new_v4(),
                definition_id,
                raw_value: 2.5,
                base_value: None,
                raw_timestamp: datetime!(2024-05-01 08:00:01 UTC),
                sample_timestamp: datetime!(2024-05-01 08:00:02 UTC),
                sampling_kind: SamplingKind::RawCount,
            }),
            PacketBody::EventValue(EventValueRecord {
                metric_id: Uuid::new_v4(),
                definition_id,
                values: vec![12.0],
                event_timestamp: datetime!(2024-05-01 08:00:03 UTC),
            }),
            PacketBody::SessionInfo(summary),
            PacketBody::FragmentInfo(FragmentInfo {
                fragment_id: Uuid::new_v4(),
                file_sequence: 2,
                fragment_start_time: datetime!(2024-05-01 08:00:04 UTC),
            }),
            PacketBody::SessionClose(SessionClose {
                status: SessionStatus::Crashed,
                reason: "killed".into(),
            }),
            PacketBody::Command(CommandPacket {
                command: Command::ExitMode(SessionStatus::Normal),
                reason: "shutdown".into(),
            }),
        ];
        let packets: Vec<Packet> = bodies.into_iter().map(stamped).collect();
        let decoded = round_trip(packets.clone());
        assert_eq!(decoded, packets);
    }

    #[test]
    fn metric_packets_round_trip() {
        let definition_id = Uuid::new_v4();
        let metric_id = Uuid::new_v4();
        let definition = MetricDefinitionRecord {
            id: definition_id,
            metric_type_name: "process".into(),
            category: "Process.Memory".into(),
            counter: "working_set".into(),
            is_event: false,
            sampling_kind: SamplingKind::TotalCount,
            interval: SampleInterval::Second,
            unit_caption: "bytes".into(),
            bound_type_name: None,
            name_member_name: None,
            event_values: Vec::new(),
        };
        let sample = SampledValueRecord {
            metric_id,
            definition_id,
            raw_value: 1234.5,
            base_value: Some(10.0),
            raw_timestamp: datetime!(2024-05-01 12:00:00 UTC),
            sample_timestamp: datetime!(2024-05-01 12:00:01 UTC),
            sampling_kind: SamplingKind::TotalCount,
        };
        let decoded = round_trip(vec![
            stamped(PacketBody::MetricDefinition(definition.clone())),
            stamped(PacketBody::SampledValue(sample.clone())),
        ]);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].body, PacketBody::MetricDefinition(definition));
        assert_eq!(decoded[1].body, PacketBody::SampledValue(sample));
    }
}

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use tracing::warn;

use super::header::FragmentHeader;
use crate::error::Result;
use crate::packet::codec::PacketDecoder;
use crate::packet::Packet;

/// A fully-read fragment.
///
/// A decode failure mid-stream discards the rest of the fragment and is
/// reported through `corrupt`/`packets_lost` instead of an error; only a
/// damaged header fails the read outright.
#[derive(Debug)]
pub struct ReadFragment {
    /// Validated header.
    pub header: FragmentHeader,
    /// Packets decoded before any failure.
    pub packets: Vec<Packet>,
    /// True when the packet stream was cut short by corruption.
    pub corrupt: bool,
    /// Packets known to be lost to corruption. The tail of an aborted
    /// stream cannot be counted, so this is a lower bound.
    pub packets_lost: u64,
}

/// Reads only the header; used by index refresh, which never touches packet
/// bodies.
pub fn read_fragment_header(path: &Path) -> Result<FragmentHeader> {
    let mut file = BufReader::new(File::open(path)?);
    let (header, _) = FragmentHeader::read(&mut file)?;
    Ok(header)
}

/// Reads the header and the whole packet stream.
pub fn read_fragment(path: &Path) -> Result<ReadFragment> {
    let mut file = BufReader::new(File::open(path)?);
    let (header, _) = FragmentHeader::read(&mut file)?;
    let mut decoder = PacketDecoder::new(file);
    let mut packets = Vec::new();
    let mut corrupt = false;
    let mut packets_lost = 0u64;
    loop {
        match decoder.next_packet() {
            Ok(Some(packet)) => packets.push(packet),
            Ok(None) => break,
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    decoded = packets.len(),
                    "fragment.read.stream_aborted"
                );
                corrupt = true;
                packets_lost = 1;
                break;
            }
        }
    }
    Ok(ReadFragment {
        header,
        packets,
        corrupt,
        packets_lost,
    })
}

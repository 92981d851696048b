//! Transport stream input for the section filter.
//!
//! Packets are taken from arbitrary byte chunks, the EIT and TDT PIDs are
//! reassembled into sections and every section is handed to an
//! [`EitFilter`].

use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use eit_protocol::{pid, SectionCollector};
use log::{debug, trace};
use serde::Serialize;

use crate::epg::SectionOutcome;
use crate::filter::{EitFilter, FilterOutcome};

pub const TS_PACKET_SIZE: usize = 188;
const SYNC_BYTE: u8 = 0x47;

/// Bytes requested from the input per read.
const READ_CHUNK_SIZE: usize = TS_PACKET_SIZE * 512;

/// The parts of a TS packet header the reader needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PacketHeader {
    transport_error: bool,
    payload_unit_start: bool,
    pid: u16,
    scrambling_control: u8,
    adaptation_field_control: u8,
    continuity_counter: u8,
}

impl PacketHeader {
    fn parse(packet: &[u8]) -> Self {
        Self {
            transport_error: packet[1] & 0x80 != 0,
            payload_unit_start: packet[1] & 0x40 != 0,
            pid: ((packet[1] as u16 & 0x1F) << 8) | packet[2] as u16,
            scrambling_control: (packet[3] >> 6) & 0x03,
            adaptation_field_control: (packet[3] >> 4) & 0x03,
            continuity_counter: packet[3] & 0x0F,
        }
    }

    fn has_payload(&self) -> bool {
        self.adaptation_field_control & 0x01 != 0
    }

    fn has_adaptation_field(&self) -> bool {
        self.adaptation_field_control & 0x02 != 0
    }
}

/// Counters for one replay.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReaderStats {
    pub packets: u64,
    /// Times the reader had to search for the next sync byte.
    pub resyncs: u64,
    pub sections: u64,
    pub eit_processed: u64,
    /// EIT sections that changed a schedule.
    pub eit_modified: u64,
    /// EIT sections dropped by the reconciler (duplicates, unknown channels...).
    pub eit_skipped: u64,
    pub time_sections: u64,
    pub invalid: u64,
    pub ignored: u64,
}

impl ReaderStats {
    fn record(&mut self, outcome: &FilterOutcome) {
        match outcome {
            FilterOutcome::Eit(SectionOutcome::Processed { modified, .. }) => {
                self.eit_processed += 1;
                if *modified {
                    self.eit_modified += 1;
                }
            }
            FilterOutcome::Eit(_) => self.eit_skipped += 1,
            FilterOutcome::Time(_) => self.time_sections += 1,
            FilterOutcome::Invalid(_) => self.invalid += 1,
            FilterOutcome::Disabled | FilterOutcome::Ignored => self.ignored += 1,
        }
    }
}

/// Splits a byte stream into packets and feeds the filter.
pub struct TsReader {
    filter: Arc<EitFilter>,
    pending: BytesMut,
    collectors: HashMap<u16, SectionCollector>,
    stats: ReaderStats,
}

impl TsReader {
    pub fn new(filter: Arc<EitFilter>) -> Self {
        Self {
            filter,
            pending: BytesMut::with_capacity(READ_CHUNK_SIZE + TS_PACKET_SIZE),
            collectors: HashMap::new(),
            stats: ReaderStats::default(),
        }
    }

    pub fn filter(&self) -> &Arc<EitFilter> {
        &self.filter
    }

    pub fn stats(&self) -> ReaderStats {
        self.stats
    }

    /// Consume a chunk of the stream. Incomplete packets are kept for the
    /// next call.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);

        while self.pending.len() >= TS_PACKET_SIZE {
            if self.pending[0] != SYNC_BYTE {
                self.stats.resyncs += 1;
                match self.pending[1..].iter().position(|&b| b == SYNC_BYTE) {
                    Some(skip) => self.pending.advance(skip + 1),
                    None => self.pending.clear(),
                }
                continue;
            }

            let packet = self.pending.split_to(TS_PACKET_SIZE);
            self.process_packet(&packet);
        }
    }

    fn process_packet(&mut self, packet: &[u8]) {
        self.stats.packets += 1;
        let header = PacketHeader::parse(packet);

        if header.transport_error || header.scrambling_control != 0 || !header.has_payload() {
            return;
        }
        if header.pid != pid::EIT && header.pid != pid::TDT {
            return;
        }

        let mut offset = 4;
        if header.has_adaptation_field() {
            offset += 1 + packet[4] as usize;
            if offset >= TS_PACKET_SIZE {
                trace!("[TS] Adaptation field fills packet on PID 0x{:04X}", header.pid);
                return;
            }
        }

        let sections = self.collectors.entry(header.pid).or_default().add_data(
            &packet[offset..],
            header.continuity_counter,
            header.payload_unit_start,
        );
        for section in sections {
            self.stats.sections += 1;
            let outcome = self.filter.process(header.pid, &section);
            self.stats.record(&outcome);
        }
    }
}

/// Read `input` to the end (or until `stop` is set) on a blocking task and
/// feed everything to `filter`.
pub async fn replay<R>(input: R, filter: Arc<EitFilter>, stop: Arc<AtomicBool>) -> io::Result<ReaderStats>
where
    R: Read + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut input = input;
        let mut reader = TsReader::new(filter);
        let mut buf = vec![0u8; READ_CHUNK_SIZE];

        while !stop.load(Ordering::Relaxed) {
            let n = match input.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            reader.feed(&buf[..n]);
        }

        if stop.load(Ordering::Relaxed) {
            debug!("[TS] Replay stopped after {} packets", reader.stats().packets);
        }
        Ok(reader.stats())
    })
    .await
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock_sync::{ClockSync, OsClock};
    use crate::config::{EpgConfig, TimeConfig};
    use crate::epg::{EpgHandlers, EventReconciler};
    use crate::filter::DisableWindow;
    use crate::store::{ChannelId, Channels, Schedules, StateLock};
    use eit_protocol::{
        encode_eit_section, Descriptor, EitEvent, EitSection, RunningStatus, ShortEventDescriptor,
    };

    fn filter() -> Arc<EitFilter> {
        let reconciler = Arc::new(EventReconciler::new(
            EpgConfig::default(),
            Arc::new(StateLock::new("channels", Channels::new())),
            Arc::new(StateLock::new("schedules", Schedules::new())),
            Arc::new(EpgHandlers::new()),
        ));
        let clock = Arc::new(OsClock);
        Arc::new(EitFilter::new(
            1,
            11836,
            TimeConfig::default(),
            reconciler,
            Arc::new(ClockSync::new(clock.clone())),
            clock,
            Arc::new(DisableWindow::new()),
        ))
    }

    fn section() -> Vec<u8> {
        let now = chrono::Utc::now().timestamp();
        let events = (0..8)
            .map(|i| EitEvent {
                event_id: 100 + i,
                start_time: now + i as i64 * 1800,
                duration: 1800,
                running_status: RunningStatus::Undefined,
                free_ca_mode: false,
                descriptors: vec![Descriptor::ShortEvent(ShortEventDescriptor {
                    language: "deu".to_string(),
                    name: format!("Sendung {}", i),
                    text: "Eine recht lange Beschreibung, damit die Sektion mehrere Pakete belegt".to_string(),
                })],
            })
            .collect();
        let section = EitSection {
            table_id: 0x50,
            service_id: 0x6D66,
            version_number: 3,
            transport_stream_id: 0x0437,
            original_network_id: 1,
            last_table_id: 0x50,
            events,
            ..Default::default()
        };
        encode_eit_section(&section).unwrap().to_vec()
    }

    /// Split a section into TS packets starting with continuity counter `cc`.
    fn packetize(pid: u16, section: &[u8], mut cc: u8) -> Vec<u8> {
        let mut out = Vec::new();
        let mut payload = vec![0u8];
        payload.extend_from_slice(section);

        for (i, chunk) in payload.chunks(TS_PACKET_SIZE - 4).enumerate() {
            let pusi = if i == 0 { 0x40 } else { 0x00 };
            out.push(SYNC_BYTE);
            out.push(pusi | (pid >> 8) as u8);
            out.push(pid as u8);
            out.push(0x10 | cc);
            out.extend_from_slice(chunk);
            out.resize(out.len() + TS_PACKET_SIZE - 4 - chunk.len(), 0xFF);
            cc = (cc + 1) & 0x0F;
        }
        out
    }

    fn channel_id() -> ChannelId {
        ChannelId::new(1, 1, 0x0437, 0x6D66)
    }

    #[test]
    fn test_section_across_packets_and_chunks() {
        let data = packetize(pid::EIT, &section(), 0);
        assert!(data.len() > 2 * TS_PACKET_SIZE);

        let mut reader = TsReader::new(filter());
        for chunk in data.chunks(100) {
            reader.feed(chunk);
        }

        let stats = reader.stats();
        assert_eq!(stats.packets as usize, data.len() / TS_PACKET_SIZE);
        assert_eq!(stats.sections, 1);
        assert_eq!(stats.eit_processed, 1);
        assert_eq!(stats.eit_modified, 1);

        let schedules = reader.filter().reconciler().schedules().read();
        assert_eq!(schedules.get(&channel_id()).map(|s| s.len()), Some(8));
    }

    #[test]
    fn test_resync_after_garbage() {
        let mut data = vec![0x00, 0x12, 0x34];
        data.extend(packetize(pid::EIT, &section(), 5));

        let mut reader = TsReader::new(filter());
        reader.feed(&data);
        assert_eq!(reader.stats().resyncs, 1);
        assert_eq!(reader.stats().eit_processed, 1);
    }

    #[test]
    fn test_foreign_and_scrambled_packets_skipped() {
        let mut data = packetize(0x0011, &section(), 0);
        let mut scrambled = packetize(pid::EIT, &section(), 0);
        for packet in scrambled.chunks_mut(TS_PACKET_SIZE) {
            packet[3] |= 0x80;
        }
        data.extend(scrambled);

        let mut reader = TsReader::new(filter());
        reader.feed(&data);
        assert_eq!(reader.stats().sections, 0);
        assert!(reader.filter().reconciler().schedules().read().is_empty());
    }

    #[test]
    fn test_duplicate_section_counted_as_skipped() {
        let sec = section();
        let mut data = packetize(pid::EIT, &sec, 0);
        let n = (data.len() / TS_PACKET_SIZE) as u8;
        data.extend(packetize(pid::EIT, &sec, n));

        let mut reader = TsReader::new(filter());
        reader.feed(&data);
        assert_eq!(reader.stats().sections, 2);
        assert_eq!(reader.stats().eit_processed, 1);
        assert_eq!(reader.stats().eit_skipped, 1);
    }

    #[tokio::test]
    async fn test_replay_reads_to_end() {
        let data = packetize(pid::EIT, &section(), 0);
        let stop = Arc::new(AtomicBool::new(false));

        let f = filter();
        let stats = replay(io::Cursor::new(data), f.clone(), stop).await.unwrap();
        assert_eq!(stats.eit_processed, 1);
        assert_eq!(f.reconciler().schedules().read().len(), 1);
    }

    #[tokio::test]
    async fn test_replay_honours_stop() {
        let data = packetize(pid::EIT, &section(), 0);
        let stop = Arc::new(AtomicBool::new(true));

        let stats = replay(io::Cursor::new(data), filter(), stop).await.unwrap();
        assert_eq!(stats, ReaderStats::default());
    }
}

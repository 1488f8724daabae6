// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Isochronous stream, the callback target of isochronous context.
//!
//! The callbacks run in the realtime context. They never allocate, block, nor log. They only
//! touch the packet buffer and atomic counters.

use {
    super::packet_buffer::*,
    firewire_isoch_protocols::{
        cip::{CipHeader, CIP_HEADER_SIZE},
        cycle_time::CycleTime,
        IsochStreamError,
    },
    std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// The size of header queued with each packet: cycle time (4), tag, sy, and reserved (2).
pub const ISO_HEADER_SIZE: usize = 8;

/// The tag for packet with CIP header.
pub const ISO_TAG_CIP: u8 = 1;

/// Build the header queued with packet.
pub fn build_iso_header(cycle_time: &CycleTime, tag: u8, sy: u8) -> [u8; ISO_HEADER_SIZE] {
    let mut header = [0; ISO_HEADER_SIZE];
    header[..4].copy_from_slice(&cycle_time.raw().to_le_bytes());
    header[4] = tag;
    header[5] = sy;
    header
}

/// Parse the header queued with packet.
pub fn parse_iso_header(header: &[u8]) -> (CycleTime, u8, u8) {
    let mut quadlet = [0; 4];
    quadlet.copy_from_slice(&header[..4]);
    (
        CycleTime::from_raw(u32::from_le_bytes(quadlet)),
        header[4],
        header[5],
    )
}

/// The direction of isochronous context.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IsoDirection {
    Receive,
    Transmit,
}

/// The disposition returned to isochronous context.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IsoDisposition {
    /// Continue processing.
    Ok,
    /// Stop processing since the peer of packet buffer is released.
    Stop,
}

/// The information of packet to transmit.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct IsoPacketInfo {
    pub length: usize,
    pub tag: u8,
    pub sy: u8,
}

/// Counters shared between the realtime context and the others.
#[derive(Debug, Default)]
pub struct IsoStreamStats {
    packets: AtomicU64,
    dropped: AtomicU64,
    os_dropped: AtomicU64,
    no_data: AtomicU64,
    oversized: AtomicU64,
    foreign: AtomicU64,
}

/// The snapshot of counters.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct IsoStreamStatsSnapshot {
    /// The number of callbacks.
    pub packets: u64,
    /// The number of packets dropped due to overflow or underflow of packet buffer.
    pub dropped: u64,
    /// The number of packets dropped by the isochronous context.
    pub os_dropped: u64,
    /// The number of packets transmitted without data.
    pub no_data: u64,
    /// The number of packets larger than the packet buffer accepts.
    pub oversized: u64,
    /// The number of packets for the other channel.
    pub foreign: u64,
}

impl IsoStreamStats {
    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> IsoStreamStatsSnapshot {
        IsoStreamStatsSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            os_dropped: self.os_dropped.load(Ordering::Relaxed),
            no_data: self.no_data.load(Ordering::Relaxed),
            oversized: self.oversized.load(Ordering::Relaxed),
            foreign: self.foreign.load(Ordering::Relaxed),
        }
    }

    fn increment(counter: &AtomicU64, count: u64) {
        counter.fetch_add(count, Ordering::Relaxed);
    }
}

/// The stream to receive packets.
#[derive(Debug)]
pub struct IsoReceiveStream {
    channel: u8,
    packets: PacketProducer,
    stats: Arc<IsoStreamStats>,
}

impl IsoReceiveStream {
    pub fn new(channel: u8, packets: PacketProducer) -> Self {
        Self {
            channel,
            packets,
            stats: Default::default(),
        }
    }

    /// Queue the received packet. Overflow is counted and the packet is dropped.
    pub fn put_packet(
        &mut self,
        data: &[u8],
        channel: u8,
        tag: u8,
        sy: u8,
        cycle: &CycleTime,
        dropped: u32,
    ) -> IsoDisposition {
        IsoStreamStats::increment(&self.stats.packets, 1);
        if dropped > 0 {
            IsoStreamStats::increment(&self.stats.os_dropped, dropped as u64);
        }

        if channel != self.channel {
            IsoStreamStats::increment(&self.stats.foreign, 1);
            return IsoDisposition::Ok;
        }

        let header = build_iso_header(cycle, tag, sy);
        match self.packets.add_packet(&header, data) {
            Ok(_) => (),
            Err(IsochStreamError::TooLarge) => {
                IsoStreamStats::increment(&self.stats.oversized, 1)
            }
            Err(_) => IsoStreamStats::increment(&self.stats.dropped, 1),
        }

        if self.packets.is_abandoned() {
            IsoDisposition::Stop
        } else {
            IsoDisposition::Ok
        }
    }
}

/// The stream to transmit packets.
#[derive(Debug)]
pub struct IsoTransmitStream {
    channel: u8,
    packets: PacketConsumer,
    stats: Arc<IsoStreamStats>,
    header: [u8; ISO_HEADER_SIZE],
    sid: u8,
    dbs: u8,
    next_dbc: u8,
    tag: u8,
    sy: u8,
}

impl IsoTransmitStream {
    /// The source node ID and data block size are used for packet without data until the first
    /// packet is dequeued.
    pub fn new(channel: u8, packets: PacketConsumer, sid: u8, dbs: u8) -> Self {
        Self {
            channel,
            packets,
            stats: Default::default(),
            header: [0; ISO_HEADER_SIZE],
            sid,
            dbs,
            next_dbc: 0,
            tag: ISO_TAG_CIP,
            sy: 0,
        }
    }

    /// Dequeue the packet to transmit. When no packet is available, the packet without data is
    /// generated so that the device keeps synchronization.
    pub fn get_packet(
        &mut self,
        data: &mut [u8],
        _cycle: &CycleTime,
        dropped: u32,
    ) -> (IsoDisposition, IsoPacketInfo) {
        IsoStreamStats::increment(&self.stats.packets, 1);
        if dropped > 0 {
            IsoStreamStats::increment(&self.stats.os_dropped, dropped as u64);
        }

        let length = match self.packets.get_next_packet(&mut self.header, data) {
            Ok(length) => {
                self.tag = self.header[4];
                self.sy = self.header[5];
                self.track_data_block_counter(&data[..length]);
                length
            }
            Err(IsochStreamError::TooLarge) => {
                let _ = self.packets.skip_packet();
                IsoStreamStats::increment(&self.stats.oversized, 1);
                self.build_no_data(data)
            }
            Err(_) => {
                IsoStreamStats::increment(&self.stats.dropped, 1);
                self.build_no_data(data)
            }
        };

        let disposition = if self.packets.is_abandoned() && length <= CIP_HEADER_SIZE {
            IsoDisposition::Stop
        } else {
            IsoDisposition::Ok
        };

        let info = IsoPacketInfo {
            length,
            tag: self.tag,
            sy: self.sy,
        };

        (disposition, info)
    }

    fn track_data_block_counter(&mut self, packet: &[u8]) {
        if let Ok(header) = CipHeader::parse(packet) {
            self.sid = header.sid;
            if header.is_no_data() {
                self.next_dbc = header.dbc;
            } else {
                self.dbs = header.dbs;
                let blocks = header
                    .data_block_count(packet.len() - CIP_HEADER_SIZE)
                    .unwrap_or_default();
                self.next_dbc = header.dbc.wrapping_add(blocks as u8);
            }
        }
    }

    fn build_no_data(&mut self, data: &mut [u8]) -> usize {
        IsoStreamStats::increment(&self.stats.no_data, 1);
        match CipHeader::no_data(self.sid, self.dbs, self.next_dbc).build(data) {
            Ok(_) => CIP_HEADER_SIZE,
            Err(_) => 0,
        }
    }
}

/// The stream of either direction.
#[derive(Debug)]
pub enum IsoStream {
    Receive(IsoReceiveStream),
    Transmit(IsoTransmitStream),
}

impl IsoStream {
    pub fn direction(&self) -> IsoDirection {
        match self {
            Self::Receive(_) => IsoDirection::Receive,
            Self::Transmit(_) => IsoDirection::Transmit,
        }
    }

    pub fn channel(&self) -> u8 {
        match self {
            Self::Receive(s) => s.channel,
            Self::Transmit(s) => s.channel,
        }
    }

    pub fn set_channel(&mut self, channel: u8) {
        match self {
            Self::Receive(s) => s.channel = channel,
            Self::Transmit(s) => s.channel = channel,
        }
    }

    pub fn stats(&self) -> &Arc<IsoStreamStats> {
        match self {
            Self::Receive(s) => &s.stats,
            Self::Transmit(s) => &s.stats,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn receive_stream_overflow() {
        // 8 data blocks of 4 bytes per packet, 100 packets.
        let (producer, mut consumer) = PacketBuffer::new(ISO_HEADER_SIZE, 100, 32).unwrap();
        let mut stream = IsoReceiveStream::new(5, producer);
        let stats = stream.stats.clone();

        (0..150u32).for_each(|i| {
            let data: Vec<u8> = (0..32).map(|b| (i as u8).wrapping_add(b)).collect();
            let cycle = CycleTime::from_cycles(i as u64);
            let disposition = stream.put_packet(&data, 5, 1, 0, &cycle, 0);
            assert_eq!(disposition, IsoDisposition::Ok);
        });

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.packets, 150);
        assert_eq!(snapshot.dropped, 50);
        assert_eq!(consumer.get_buffer_fill_packets(), 100);

        let mut header = [0; ISO_HEADER_SIZE];
        let mut buf = [0; 32];
        (0..100u32).for_each(|i| {
            let len = consumer.get_next_packet(&mut header, &mut buf).unwrap();
            assert_eq!(len, 32);
            assert_eq!(buf[0], i as u8);
            let (cycle, tag, sy) = parse_iso_header(&header);
            assert_eq!(cycle, CycleTime::from_cycles(i as u64));
            assert_eq!(tag, 1);
            assert_eq!(sy, 0);
        });
        assert_eq!(
            consumer.get_next_packet(&mut header, &mut buf),
            Err(IsochStreamError::Underflow)
        );
    }

    #[test]
    fn receive_stream_counts() {
        let (producer, consumer) = PacketBuffer::new(ISO_HEADER_SIZE, 4, 8).unwrap();
        let mut stream = IsoReceiveStream::new(1, producer);
        let cycle = CycleTime::default();

        stream.put_packet(&[0; 8], 2, 1, 0, &cycle, 3);
        stream.put_packet(&[0; 16], 1, 1, 0, &cycle, 0);

        let snapshot = stream.stats.snapshot();
        assert_eq!(snapshot.packets, 2);
        assert_eq!(snapshot.os_dropped, 3);
        assert_eq!(snapshot.foreign, 1);
        assert_eq!(snapshot.oversized, 1);
        assert_eq!(snapshot.dropped, 0);

        drop(consumer);
        assert_eq!(
            stream.put_packet(&[0; 8], 1, 1, 0, &cycle, 0),
            IsoDisposition::Stop
        );
    }

    #[test]
    fn transmit_stream_generates_no_data() {
        let (mut producer, consumer) = PacketBuffer::new(ISO_HEADER_SIZE, 4, 32).unwrap();
        let mut stream = IsoTransmitStream::new(3, consumer, 0x3f, 2);
        let cycle = CycleTime::default();
        let mut data = [0; 32];

        let (disposition, info) = stream.get_packet(&mut data, &cycle, 0);
        assert_eq!(disposition, IsoDisposition::Ok);
        assert_eq!(info.length, 8);
        assert_eq!(info.tag, ISO_TAG_CIP);
        let header = CipHeader::parse(&data).unwrap();
        assert!(header.is_no_data());
        assert_eq!(header.dbc, 0);

        // 3 data blocks of 8 bytes.
        let mut packet = [0; 32];
        CipHeader::am824(0x3f, 2, 0xfe, 2, 0x1234)
            .build(&mut packet)
            .unwrap();
        producer
            .add_packet(&build_iso_header(&cycle, ISO_TAG_CIP, 0), &packet)
            .unwrap();

        let (_, info) = stream.get_packet(&mut data, &cycle, 0);
        assert_eq!(info.length, 32);
        assert_eq!(CipHeader::parse(&data).unwrap().syt, 0x1234);

        let (_, info) = stream.get_packet(&mut data, &cycle, 0);
        assert_eq!(info.length, 8);
        let header = CipHeader::parse(&data).unwrap();
        assert!(header.is_no_data());
        assert_eq!(header.dbc, 0x01);

        let snapshot = stream.stats.snapshot();
        assert_eq!(snapshot.packets, 3);
        assert_eq!(snapshot.no_data, 2);
        assert_eq!(snapshot.dropped, 2);
    }
}

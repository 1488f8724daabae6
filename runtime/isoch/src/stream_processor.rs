// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Stream processors, the consumer of received packets and the producer of packets to transmit.
//!
//! The processors run in the thread of application, never in the realtime context. They
//! interpret the event cluster in packets according to the layout of ports, and transfer the
//! slots from/to ports.

use {
    super::{iso_stream::*, packet_buffer::*, port::*, syt_monitor::*},
    firewire_isoch_protocols::{
        am824::midi_mpx_index, cip::*, cycle_time::*, layout::*, midi::MidiParserState,
        IsochProtocolError, IsochStreamError,
    },
    glib::Error,
    tracing::{debug, warn},
};

/// The delay from transmission to presentation for packets generated by host, in ticks.
pub const TRANSFER_DELAY_TICKS: u32 = 0x2e00;

/// The configuration of stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// The sampling rate.
    pub rate: u32,
    pub optical: OpticalMode,
    /// The number of packets processed per interrupt of isochronous context.
    pub irq_interval: usize,
    /// The number of packets in the packet buffer.
    pub buffer_packets: usize,
    /// The number of slots in ring buffer of each port.
    pub port_capacity: usize,
    /// The delay from transmission to presentation, in ticks.
    pub transfer_delay: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            rate: 48000,
            optical: OpticalMode::Off,
            irq_interval: 16,
            buffer_packets: 256,
            port_capacity: 8192,
            transfer_delay: TRANSFER_DELAY_TICKS,
        }
    }
}

/// The maximum number of events in one cycle at the sampling rate.
pub fn max_events_per_cycle(rate: u32) -> usize {
    ((rate + CYCLES_PER_SECOND - 1) / CYCLES_PER_SECOND) as usize
}

const TIER_MAX_RATES: [(RateTier, u32); 3] = [
    (RateTier::Single, 48000),
    (RateTier::Double, 96000),
    (RateTier::Quadruple, 192000),
];

const OPTICAL_MODES: [OpticalMode; 3] = [
    OpticalMode::Off,
    OpticalMode::Adat,
    OpticalMode::Toslink,
];

/// The maximum size of packet for any configuration supported by the layout.
pub fn max_packet_size(spec: &'static LayoutSpec) -> usize {
    let max_cluster = TIER_MAX_RATES
        .into_iter()
        .flat_map(|(tier, rate)| {
            OPTICAL_MODES
                .into_iter()
                .map(move |optical| (tier, rate, optical))
        })
        .filter_map(|(tier, rate, optical)| {
            StreamLayout::new(spec, tier, optical)
                .ok()
                .map(|layout| layout.event_size() * max_events_per_cycle(rate))
        })
        .max()
        .unwrap_or_default();
    CIP_HEADER_SIZE + max_cluster
}

/// Compute the layout for the sampling rate and the mode of optical interface.
pub fn compute_layout(
    spec: &'static LayoutSpec,
    rate: u32,
    optical: OpticalMode,
) -> Result<StreamLayout, Error> {
    let tier = RateTier::from_rate(rate)
        .filter(|_| sfc_from_rate(rate).is_some())
        .ok_or_else(|| {
            let msg = format!("Unsupported sampling rate {} for {}", rate, spec.name);
            Error::new(IsochProtocolError::UnsupportedConfiguration, &msg)
        })?;
    StreamLayout::new(spec, tier, optical).map_err(|cause| {
        let msg = format!(
            "Unsupported configuration for {}: rate {}, optical {:?}",
            spec.name, rate, optical
        );
        Error::new(cause, &msg)
    })
}

/// The table of ports indexed by the position in static table. The direction of ports follows
/// the processor, thus the playback layout can be decoded to monitor the stream of own.
#[derive(Debug)]
struct PortTable {
    spec: &'static LayoutSpec,
    direction: StreamDirection,
    ports: Vec<Option<Port>>,
}

impl PortTable {
    fn new(spec: &'static LayoutSpec, direction: StreamDirection) -> Self {
        Self {
            spec,
            direction,
            ports: spec.ports.iter().map(|_| None).collect(),
        }
    }

    fn add(
        &mut self,
        layout: &StreamLayout,
        name: &str,
        capacity: usize,
    ) -> Result<PortHandle, Error> {
        let index = self.spec.port_index(name).ok_or_else(|| {
            let msg = format!("Port {} is not available in {}", name, self.spec.name);
            Error::new(IsochStreamError::InvalidState, &msg)
        })?;

        if self.ports[index].is_some() {
            let msg = format!("Port {} is already added to {}", name, self.spec.name);
            Err(Error::new(IsochStreamError::InvalidState, &msg))?;
        }

        let (port, handle) = create_port(
            &self.spec.ports[index],
            self.direction,
            self.spec.format,
            capacity,
        );
        port.stats().set_enabled(layout.is_present(index));
        self.ports[index] = Some(port);

        Ok(handle)
    }

    fn remove(&mut self, name: &str) -> Result<(), Error> {
        self.ports
            .iter_mut()
            .find(|entry| entry.as_ref().map(|port| port.name() == name).unwrap_or(false))
            .and_then(|entry| entry.take())
            .map(|port| port.stats().set_enabled(false))
            .ok_or_else(|| {
                let msg = format!("Port {} is not added to {}", name, self.spec.name);
                Error::new(IsochStreamError::InvalidState, &msg)
            })
    }

    fn update(&self, layout: &StreamLayout) {
        self.ports.iter().enumerate().for_each(|(i, entry)| {
            if let Some(port) = entry {
                port.stats().set_enabled(layout.is_present(i));
            }
        });
    }

    fn find(&self, name: &str) -> Option<&Port> {
        self.ports.iter().flatten().find(|port| port.name() == name)
    }
}

impl PortSink for PortTable {
    fn put_slot(&mut self, index: usize, _: usize, slot: &[u8]) {
        if let Some(Some(port)) = self.ports.get_mut(index) {
            port.put_slot(slot);
        }
    }
}

struct PlaybackSource<'a> {
    ports: &'a mut PortTable,
    dbc: u8,
}

impl<'a> PortSource for PlaybackSource<'a> {
    fn get_slot(&mut self, index: usize, event: usize, slot: &mut [u8]) -> bool {
        match self.ports.ports.get_mut(index) {
            Some(Some(port)) => port.get_slot(slot, midi_mpx_index(self.dbc, event) == 0),
            _ => false,
        }
    }
}

/// Counters of stream processor.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ProcessorStats {
    /// The number of processed packets.
    pub packets: u64,
    /// The number of processed events.
    pub frames: u64,
    /// The number of packets without data.
    pub no_data: u64,
    /// The number of packets dropped due to malformed header or payload.
    pub malformed: u64,
    /// The number of packets dropped due to the size of data block unmatched to layout.
    pub dimension_mismatches: u64,
    /// The number of discontinuities of data block counter.
    pub discontinuities: u64,
}

/// The processor of packets received from device.
#[derive(Debug)]
pub struct ReceiveStreamProcessor {
    layout: StreamLayout,
    rate: u32,
    packets: PacketConsumer,
    ports: PortTable,
    header: [u8; ISO_HEADER_SIZE],
    buf: Vec<u8>,
    next_dbc: Option<u8>,
    monitor: SytMonitor,
    stats: ProcessorStats,
}

impl ReceiveStreamProcessor {
    pub fn new(
        spec: &'static LayoutSpec,
        rate: u32,
        optical: OpticalMode,
        packets: PacketConsumer,
    ) -> Result<Self, Error> {
        let layout = compute_layout(spec, rate, optical)?;
        let buf = vec![0; packets.max_payload()];
        Ok(Self {
            layout,
            rate,
            packets,
            ports: PortTable::new(spec, StreamDirection::Capture),
            header: [0; ISO_HEADER_SIZE],
            buf,
            next_dbc: None,
            monitor: SytMonitor::new(spec.name, rate),
            stats: Default::default(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.layout.spec().name
    }

    pub fn layout(&self) -> &StreamLayout {
        &self.layout
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn stats(&self) -> &ProcessorStats {
        &self.stats
    }

    pub fn monitor(&self) -> &SytMonitor {
        &self.monitor
    }

    pub fn monitor_mut(&mut self) -> &mut SytMonitor {
        &mut self.monitor
    }

    pub fn add_port(&mut self, name: &str, capacity: usize) -> Result<PortHandle, Error> {
        self.ports.add(&self.layout, name, capacity)
    }

    /// Add all ports in the static table.
    pub fn add_all_ports(&mut self, capacity: usize) -> Result<Vec<PortHandle>, Error> {
        let spec = self.layout.spec();
        spec.ports
            .iter()
            .map(|port| self.add_port(port.name, capacity))
            .collect()
    }

    pub fn remove_port(&mut self, name: &str) -> Result<(), Error> {
        self.ports.remove(name)
    }

    /// The state of MIDI parser for the port.
    pub fn midi_parser_state(&self, name: &str) -> Option<MidiParserState> {
        self.ports.find(name).and_then(|port| port.midi_parser_state())
    }

    /// Compute the layout for the configuration without applying it.
    pub fn validate(&self, rate: u32, optical: OpticalMode) -> Result<StreamLayout, Error> {
        let layout = compute_layout(self.layout.spec(), rate, optical)?;
        if layout.event_size() * max_events_per_cycle(rate) + CIP_HEADER_SIZE > self.buf.len() {
            let msg = format!("Packet buffer is too small for {}", self.name());
            Err(Error::new(IsochStreamError::TooLarge, &msg))?;
        }
        Ok(layout)
    }

    /// Change the configuration. When the configuration is not supported, the previous
    /// configuration is kept.
    pub fn configure(&mut self, rate: u32, optical: OpticalMode) -> Result<(), Error> {
        let layout = self.validate(rate, optical)?;

        if rate != self.rate {
            self.monitor.set_rate(rate);
        }
        self.rate = rate;
        self.layout = layout;
        self.ports.update(&self.layout);
        self.next_dbc = None;

        debug!(
            name = self.name(),
            rate,
            ?optical,
            dbs = self.layout.dbs(),
            "configured"
        );

        Ok(())
    }

    /// Process packets in the packet buffer, then return the number of processed packets.
    pub fn process(&mut self) -> usize {
        let mut count = 0;

        loop {
            let len = match self.packets.get_next_packet(&mut self.header, &mut self.buf) {
                Ok(len) => len,
                Err(IsochStreamError::TooLarge) => {
                    let _ = self.packets.skip_packet();
                    self.stats.malformed += 1;
                    warn!(name = self.name(), "packet larger than the buffer is skipped");
                    continue;
                }
                Err(_) => break,
            };

            count += 1;
            self.stats.packets += 1;

            let (arrival, _, _) = parse_iso_header(&self.header);
            if let Err(cause) = self.handle_packet(len, &arrival) {
                match cause {
                    IsochProtocolError::DimensionMismatch => self.stats.dimension_mismatches += 1,
                    _ => self.stats.malformed += 1,
                }
                debug!(name = self.name(), %arrival, "packet dropped: {}", cause);
            }
        }

        count
    }

    fn handle_packet(&mut self, len: usize, arrival: &CycleTime) -> Result<(), IsochProtocolError> {
        let packet = &self.buf[..len];
        let header = CipHeader::parse(packet)?;

        if header.is_no_data() {
            self.stats.no_data += 1;
            self.next_dbc = Some(header.dbc);
            self.monitor.observe(SYT_NO_INFO, arrival, 0);
            return Ok(());
        }

        if header.dbs != self.layout.dbs() {
            Err(IsochProtocolError::DimensionMismatch)?;
        }

        let payload = &packet[CIP_HEADER_SIZE..];
        let events = header.data_block_count(payload.len())?;

        if let Some(dbc) = self.next_dbc {
            if dbc != header.dbc {
                self.stats.discontinuities += 1;
                debug!(
                    name = self.layout.spec().name,
                    expected = dbc,
                    actual = header.dbc,
                    "discontinuity of data block counter"
                );
            }
        }
        self.next_dbc = Some(header.dbc.wrapping_add(events as u8));

        demux(&self.layout, payload, events, &mut self.ports)?;

        self.monitor.observe(header.syt, arrival, events);
        self.stats.frames += events as u64;

        Ok(())
    }
}

/// The processor to generate packets to transmit.
#[derive(Debug)]
pub struct TransmitStreamProcessor {
    layout: StreamLayout,
    rate: u32,
    sfc: u8,
    sid: u8,
    packets: PacketProducer,
    ports: PortTable,
    buf: Vec<u8>,
    transfer_delay: u32,
    running: bool,
    cycle: u64,
    start_ticks: u64,
    frames: u64,
    accumulator: u32,
    dbc: u8,
    stats: ProcessorStats,
}

impl TransmitStreamProcessor {
    pub fn new(
        spec: &'static LayoutSpec,
        config: &StreamConfig,
        sid: u8,
        packets: PacketProducer,
    ) -> Result<Self, Error> {
        let layout = compute_layout(spec, config.rate, config.optical)?;
        let size = max_packet_size(spec);
        if size > packets.max_payload() {
            let msg = format!(
                "Packet buffer accepts {} bytes but {} bytes are required for {}",
                packets.max_payload(),
                size,
                spec.name
            );
            Err(Error::new(IsochStreamError::TooLarge, &msg))?;
        }

        Ok(Self {
            layout,
            rate: config.rate,
            sfc: sfc_from_rate(config.rate).unwrap_or_default(),
            sid,
            packets,
            ports: PortTable::new(spec, StreamDirection::Playback),
            buf: vec![0; size],
            transfer_delay: config.transfer_delay,
            running: false,
            cycle: 0,
            start_ticks: 0,
            frames: 0,
            accumulator: 0,
            dbc: 0,
            stats: Default::default(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.layout.spec().name
    }

    pub fn layout(&self) -> &StreamLayout {
        &self.layout
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn stats(&self) -> &ProcessorStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn add_port(&mut self, name: &str, capacity: usize) -> Result<PortHandle, Error> {
        self.ports.add(&self.layout, name, capacity)
    }

    /// Add all ports in the static table.
    pub fn add_all_ports(&mut self, capacity: usize) -> Result<Vec<PortHandle>, Error> {
        let spec = self.layout.spec();
        spec.ports
            .iter()
            .map(|port| self.add_port(port.name, capacity))
            .collect()
    }

    pub fn remove_port(&mut self, name: &str) -> Result<(), Error> {
        self.ports.remove(name)
    }

    /// Compute the layout for the configuration without applying it. The configuration is
    /// available when the processor is not running.
    pub fn validate(&self, rate: u32, optical: OpticalMode) -> Result<StreamLayout, Error> {
        if self.running {
            let msg = format!("{} is running", self.name());
            Err(Error::new(IsochStreamError::InvalidState, &msg))?;
        }
        compute_layout(self.layout.spec(), rate, optical)
    }

    /// Change the configuration. When the configuration is not supported, the previous
    /// configuration is kept.
    pub fn configure(&mut self, rate: u32, optical: OpticalMode) -> Result<(), Error> {
        let layout = self.validate(rate, optical)?;

        self.rate = rate;
        self.sfc = sfc_from_rate(rate).unwrap_or_default();
        self.layout = layout;
        self.ports.update(&self.layout);

        debug!(
            name = self.name(),
            rate,
            ?optical,
            dbs = self.layout.dbs(),
            "configured"
        );

        Ok(())
    }

    /// Start generating packets from the cycle.
    pub fn start(&mut self, cycle: u64) {
        self.running = true;
        self.cycle = cycle;
        self.start_ticks = cycles_to_ticks(cycle);
        self.frames = 0;
        self.accumulator = 0;
        self.dbc = 0;
        debug!(name = self.name(), cycle, "start");
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    /// The cycle for the next packet.
    pub fn next_cycle(&self) -> u64 {
        self.cycle
    }

    /// Generate packets until the packet buffer is full, then return the number of generated
    /// packets. It never blocks.
    pub fn fill(&mut self) -> Result<usize, Error> {
        if !self.running {
            let msg = format!("{} is not running", self.name());
            Err(Error::new(IsochStreamError::InvalidState, &msg))?;
        }

        let mut count = 0;
        while self.packets.free_packets() > 0 {
            let length = self.build_packet().map_err(|cause| {
                let msg = format!("Fail to build packet for {}", self.name());
                Error::new(cause, &msg)
            })?;
            let header = build_iso_header(&CycleTime::from_cycles(self.cycle), ISO_TAG_CIP, 0);
            self.packets
                .add_packet(&header, &self.buf[..length])
                .map_err(|cause| {
                    let msg = format!("Fail to queue packet for {}", self.name());
                    Error::new(cause, &msg)
                })?;
            self.cycle += 1;
            self.stats.packets += 1;
            count += 1;
        }

        Ok(count)
    }

    fn build_packet(&mut self) -> Result<usize, IsochProtocolError> {
        self.accumulator += self.rate;
        let events = (self.accumulator / CYCLES_PER_SECOND) as usize;
        self.accumulator %= CYCLES_PER_SECOND;

        let length = CIP_HEADER_SIZE + events * self.layout.event_size();
        if length > self.buf.len() {
            Err(IsochProtocolError::UnsupportedConfiguration)?;
        }

        let header = if events == 0 {
            self.stats.no_data += 1;
            CipHeader::no_data(self.sid, self.layout.dbs(), self.dbc)
        } else {
            // The presentation time of the first event in the packet.
            let ticks = self.start_ticks
                + self.transfer_delay as u64
                + self.frames * TICKS_PER_SECOND as u64 / self.rate as u64;
            let syt = CycleTime::from_ticks(ticks).syt();
            CipHeader::am824(self.sid, self.layout.dbs(), self.dbc, self.sfc, syt)
        };
        header.build(&mut self.buf[..length])?;

        let mut source = PlaybackSource {
            ports: &mut self.ports,
            dbc: self.dbc,
        };
        mux(
            &self.layout,
            &mut self.buf[CIP_HEADER_SIZE..length],
            events,
            &mut source,
        )?;

        self.dbc = self.dbc.wrapping_add(events as u8);
        self.frames += events as u64;
        self.stats.frames += events as u64;

        Ok(length)
    }
}

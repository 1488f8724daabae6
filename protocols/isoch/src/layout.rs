// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Protocol about layout of ports in data block.
//!
//! The module includes structure, enumeration, and trait and its implementation for the layout
//! of ports in data block (event), computed from static table of ports for each model. The
//! layout depends on the tier of sampling rate and the mode of optical interface. The module
//! also includes demultiplexing and multiplexing of event cluster according to the layout.

use super::{am824::*, IsochProtocolError};

/// The direction of stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StreamDirection {
    /// From device to host.
    Capture,
    /// From host to device.
    Playback,
}

/// The kind of port.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PortKind {
    Audio,
    Midi,
    Control,
}

/// The tier of sampling rate.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RateTier {
    /// 32.0, 44.1, and 48.0 kHz.
    Single,
    /// 88.2 and 96.0 kHz.
    Double,
    /// 176.4 and 192.0 kHz.
    Quadruple,
}

impl Default for RateTier {
    fn default() -> Self {
        Self::Single
    }
}

impl RateTier {
    pub fn from_rate(rate: u32) -> Option<Self> {
        match rate {
            32000 | 44100 | 48000 => Some(Self::Single),
            88200 | 96000 => Some(Self::Double),
            176400 | 192000 => Some(Self::Quadruple),
            _ => None,
        }
    }
}

/// The mode of optical interface.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpticalMode {
    /// Disabled.
    Off,
    /// ADAT lightpipe, 8 channels at single rate, 4 channels at double rate (S/MUX).
    Adat,
    /// TOSLINK S/PDIF, 2 channels.
    Toslink,
}

impl Default for OpticalMode {
    fn default() -> Self {
        Self::Off
    }
}

/// The format of sample in data block.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SampleFormat {
    /// AM824 quadlet with label.
    Am824,
    /// Raw 24 bit sample without label.
    Raw24,
}

/// The entry of static table for port.
#[derive(Debug, Copy, Clone)]
pub struct PortSpec {
    pub name: &'static str,
    pub kind: PortKind,
    /// The number of bytes in data block.
    pub width: usize,
    /// Whether the port is present in the configuration.
    pub presence: fn(RateTier, OpticalMode) -> bool,
}

/// The static table of ports for the stream of one direction in the model.
#[derive(Debug)]
pub struct LayoutSpec {
    pub name: &'static str,
    pub direction: StreamDirection,
    pub format: SampleFormat,
    /// The number of bytes reserved at the beginning of data block.
    pub prefix: usize,
    pub ports: &'static [PortSpec],
    /// Whether the configuration is supported by the model.
    pub supported: fn(RateTier, OpticalMode) -> bool,
}

impl LayoutSpec {
    pub fn port_index(&self, name: &str) -> Option<usize> {
        self.ports.iter().position(|port| port.name == name)
    }
}

/// The layout computed for the configuration. Ports absent in the configuration have no offset.
#[derive(Debug, Clone)]
pub struct StreamLayout {
    spec: &'static LayoutSpec,
    tier: RateTier,
    optical: OpticalMode,
    offsets: Vec<Option<usize>>,
    event_size: usize,
}

impl PartialEq for StreamLayout {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.spec, other.spec)
            && self.tier == other.tier
            && self.optical == other.optical
    }
}

impl StreamLayout {
    pub fn new(
        spec: &'static LayoutSpec,
        tier: RateTier,
        optical: OpticalMode,
    ) -> Result<Self, IsochProtocolError> {
        if !(spec.supported)(tier, optical) {
            Err(IsochProtocolError::UnsupportedConfiguration)?;
        }

        let mut pos = spec.prefix;
        let offsets = spec
            .ports
            .iter()
            .map(|port| {
                if (port.presence)(tier, optical) {
                    let offset = pos;
                    pos += port.width;
                    Some(offset)
                } else {
                    None
                }
            })
            .collect();

        // The data block is aligned to quadlet.
        let event_size = (pos + 3) / 4 * 4;

        if event_size == 0 || event_size / 4 > u8::MAX as usize {
            Err(IsochProtocolError::UnsupportedConfiguration)?;
        }

        Ok(Self {
            spec,
            tier,
            optical,
            offsets,
            event_size,
        })
    }

    pub fn spec(&self) -> &'static LayoutSpec {
        self.spec
    }

    pub fn tier(&self) -> RateTier {
        self.tier
    }

    pub fn optical(&self) -> OpticalMode {
        self.optical
    }

    /// The size of data block in bytes.
    pub fn event_size(&self) -> usize {
        self.event_size
    }

    /// The size of data block in quadlets, for DBS field of CIP header.
    pub fn dbs(&self) -> u8 {
        (self.event_size / 4) as u8
    }

    pub fn offset(&self, index: usize) -> Option<usize> {
        self.offsets.get(index).copied().flatten()
    }

    pub fn is_present(&self, index: usize) -> bool {
        self.offset(index).is_some()
    }

    /// The number of ports present in the configuration.
    pub fn present_count(&self) -> usize {
        self.offsets.iter().filter(|offset| offset.is_some()).count()
    }

    /// Iterate ports present in the configuration with index and offset.
    pub fn present_ports(&self) -> impl Iterator<Item = (usize, &'static PortSpec, usize)> + '_ {
        let ports = self.spec.ports;
        self.offsets
            .iter()
            .enumerate()
            .filter_map(move |(i, offset)| offset.map(|offset| (i, &ports[i], offset)))
    }

    /// Fill the slot with the value to express no data for the port.
    pub fn fill_slot(&self, index: usize, slot: &mut [u8]) {
        let kind = self.spec.ports[index].kind;
        match (kind, self.spec.format) {
            (PortKind::Midi, _) if slot.len() >= AM824_SIZE => serialize_midi(&[], slot),
            (PortKind::Audio, SampleFormat::Am824) if slot.len() >= AM824_SIZE => {
                serialize_audio(0, slot)
            }
            _ => slot.fill(0),
        }
    }

    /// Fill whole data block with the value to express no data.
    pub fn fill_event(&self, event: &mut [u8]) {
        event.fill(0);
        self.offsets.iter().enumerate().for_each(|(i, offset)| {
            if let Some(offset) = offset {
                let width = self.spec.ports[i].width;
                self.fill_slot(i, &mut event[*offset..(*offset + width)]);
            }
        });
    }
}

/// The consumer of slots demultiplexed from event cluster.
pub trait PortSink {
    fn put_slot(&mut self, index: usize, event: usize, slot: &[u8]);
}

/// The producer of slots multiplexed into event cluster.
pub trait PortSource {
    /// Write the slot for the port at the event. False means no data available for the port,
    /// then the slot is filled with the value to express no data.
    fn get_slot(&mut self, index: usize, event: usize, slot: &mut [u8]) -> bool;
}

/// Demultiplex the cluster of events into slots of ports present in the layout. The cluster
/// shorter than the events is rejected before any slot is delivered.
pub fn demux<S: PortSink>(
    layout: &StreamLayout,
    cluster: &[u8],
    events: usize,
    sink: &mut S,
) -> Result<(), IsochProtocolError> {
    let event_size = layout.event_size();
    if cluster.len() < events * event_size {
        Err(IsochProtocolError::ShortPacket)?;
    }

    cluster
        .chunks_exact(event_size)
        .take(events)
        .enumerate()
        .for_each(|(e, event)| {
            layout.present_ports().for_each(|(i, port, offset)| {
                sink.put_slot(i, e, &event[offset..(offset + port.width)]);
            });
        });

    Ok(())
}

/// Multiplex slots of ports present in the layout into the cluster of events. Bytes not
/// covered by any port are zero.
pub fn mux<S: PortSource>(
    layout: &StreamLayout,
    cluster: &mut [u8],
    events: usize,
    source: &mut S,
) -> Result<(), IsochProtocolError> {
    let event_size = layout.event_size();
    if cluster.len() < events * event_size {
        Err(IsochProtocolError::ShortPacket)?;
    }

    cluster
        .chunks_exact_mut(event_size)
        .take(events)
        .enumerate()
        .for_each(|(e, event)| {
            event.fill(0);
            layout.present_ports().for_each(|(i, port, offset)| {
                let slot = &mut event[offset..(offset + port.width)];
                if !source.get_slot(i, e, slot) {
                    layout.fill_slot(i, slot);
                }
            });
        });

    Ok(())
}

const fn port(
    name: &'static str,
    kind: PortKind,
    width: usize,
    presence: fn(RateTier, OpticalMode) -> bool,
) -> PortSpec {
    PortSpec {
        name,
        kind,
        width,
        presence,
    }
}

fn always(_: RateTier, _: OpticalMode) -> bool {
    true
}

fn below_quadruple(tier: RateTier, _: OpticalMode) -> bool {
    tier != RateTier::Quadruple
}

fn adat_lower(tier: RateTier, optical: OpticalMode) -> bool {
    optical == OpticalMode::Adat && tier != RateTier::Quadruple
}

fn adat_upper(tier: RateTier, optical: OpticalMode) -> bool {
    optical == OpticalMode::Adat && tier == RateTier::Single
}

fn toslink(tier: RateTier, optical: OpticalMode) -> bool {
    optical == OpticalMode::Toslink && tier != RateTier::Quadruple
}

fn optical_below_quadruple(tier: RateTier, optical: OpticalMode) -> bool {
    optical == OpticalMode::Off || tier != RateTier::Quadruple
}

fn without_adat_below_quadruple(tier: RateTier, optical: OpticalMode) -> bool {
    optical != OpticalMode::Adat && tier != RateTier::Quadruple
}

const MOTU_V2_RAW24: usize = RAW24_SIZE;
const MOTU_V2_CONTROL: usize = 6;

const MOTU_V2_PORTS: [PortSpec; 25] = [
    port("control", PortKind::Control, MOTU_V2_CONTROL, always),
    port("analog-1", PortKind::Audio, MOTU_V2_RAW24, always),
    port("analog-2", PortKind::Audio, MOTU_V2_RAW24, always),
    port("analog-3", PortKind::Audio, MOTU_V2_RAW24, always),
    port("analog-4", PortKind::Audio, MOTU_V2_RAW24, always),
    port("analog-5", PortKind::Audio, MOTU_V2_RAW24, always),
    port("analog-6", PortKind::Audio, MOTU_V2_RAW24, always),
    port("analog-7", PortKind::Audio, MOTU_V2_RAW24, always),
    port("analog-8", PortKind::Audio, MOTU_V2_RAW24, always),
    port("main-1", PortKind::Audio, MOTU_V2_RAW24, always),
    port("main-2", PortKind::Audio, MOTU_V2_RAW24, always),
    port("spdif-1", PortKind::Audio, MOTU_V2_RAW24, below_quadruple),
    port("spdif-2", PortKind::Audio, MOTU_V2_RAW24, below_quadruple),
    port("adat-1", PortKind::Audio, MOTU_V2_RAW24, adat_lower),
    port("adat-2", PortKind::Audio, MOTU_V2_RAW24, adat_lower),
    port("adat-3", PortKind::Audio, MOTU_V2_RAW24, adat_lower),
    port("adat-4", PortKind::Audio, MOTU_V2_RAW24, adat_lower),
    port("adat-5", PortKind::Audio, MOTU_V2_RAW24, adat_upper),
    port("adat-6", PortKind::Audio, MOTU_V2_RAW24, adat_upper),
    port("adat-7", PortKind::Audio, MOTU_V2_RAW24, adat_upper),
    port("adat-8", PortKind::Audio, MOTU_V2_RAW24, adat_upper),
    port("toslink-1", PortKind::Audio, MOTU_V2_RAW24, toslink),
    port("toslink-2", PortKind::Audio, MOTU_V2_RAW24, toslink),
    // The dedicated MIDI slot, multiplexed one byte per eight data blocks.
    port("midi-1", PortKind::Midi, AM824_SIZE, always),
    port("phones-1", PortKind::Audio, MOTU_V2_RAW24, below_quadruple),
];

/// The layout of capture stream for MOTU version 2 models.
pub static MOTU_V2_CAPTURE_LAYOUT: LayoutSpec = LayoutSpec {
    name: "motu-v2-capture",
    direction: StreamDirection::Capture,
    format: SampleFormat::Raw24,
    prefix: 0,
    ports: &MOTU_V2_PORTS,
    supported: optical_below_quadruple,
};

/// The layout of playback stream for MOTU version 2 models.
pub static MOTU_V2_PLAYBACK_LAYOUT: LayoutSpec = LayoutSpec {
    name: "motu-v2-playback",
    direction: StreamDirection::Playback,
    format: SampleFormat::Raw24,
    prefix: 0,
    ports: &MOTU_V2_PORTS,
    supported: optical_below_quadruple,
};

const BEBOB_AM824: usize = AM824_SIZE;

const BEBOB_CAPTURE_PORTS: [PortSpec; 5] = [
    port("analog-1", PortKind::Audio, BEBOB_AM824, always),
    port("analog-2", PortKind::Audio, BEBOB_AM824, always),
    port("digital-1", PortKind::Audio, BEBOB_AM824, toslink),
    port("digital-2", PortKind::Audio, BEBOB_AM824, toslink),
    port("midi-1", PortKind::Midi, BEBOB_AM824, always),
];

const BEBOB_PLAYBACK_PORTS: [PortSpec; 11] = [
    port("analog-1", PortKind::Audio, BEBOB_AM824, always),
    port("analog-2", PortKind::Audio, BEBOB_AM824, always),
    port("analog-3", PortKind::Audio, BEBOB_AM824, always),
    port("analog-4", PortKind::Audio, BEBOB_AM824, always),
    port("analog-5", PortKind::Audio, BEBOB_AM824, always),
    port("analog-6", PortKind::Audio, BEBOB_AM824, always),
    port("analog-7", PortKind::Audio, BEBOB_AM824, always),
    port("analog-8", PortKind::Audio, BEBOB_AM824, always),
    port("digital-1", PortKind::Audio, BEBOB_AM824, toslink),
    port("digital-2", PortKind::Audio, BEBOB_AM824, toslink),
    port("midi-1", PortKind::Midi, BEBOB_AM824, always),
];

/// The layout of capture stream for BeBoB models with AM824 data channels.
pub static BEBOB_CAPTURE_LAYOUT: LayoutSpec = LayoutSpec {
    name: "bebob-capture",
    direction: StreamDirection::Capture,
    format: SampleFormat::Am824,
    prefix: 0,
    ports: &BEBOB_CAPTURE_PORTS,
    supported: without_adat_below_quadruple,
};

/// The layout of playback stream for BeBoB models with AM824 data channels.
pub static BEBOB_PLAYBACK_LAYOUT: LayoutSpec = LayoutSpec {
    name: "bebob-playback",
    direction: StreamDirection::Playback,
    format: SampleFormat::Am824,
    prefix: 0,
    ports: &BEBOB_PLAYBACK_PORTS,
    supported: without_adat_below_quadruple,
};

#[cfg(test)]
mod test {
    use super::{super::midi::*, *};

    #[derive(Default)]
    struct Recorder(Vec<(usize, usize, Vec<u8>)>);

    impl PortSink for Recorder {
        fn put_slot(&mut self, index: usize, event: usize, slot: &[u8]) {
            self.0.push((index, event, slot.to_vec()));
        }
    }

    impl PortSource for Recorder {
        fn get_slot(&mut self, index: usize, event: usize, slot: &mut [u8]) -> bool {
            self.0
                .iter()
                .find(|(i, e, _)| *i == index && *e == event)
                .map(|(_, _, data)| slot.copy_from_slice(data))
                .is_some()
        }
    }

    #[test]
    fn layout_presence() {
        let layout = StreamLayout::new(
            &MOTU_V2_CAPTURE_LAYOUT,
            RateTier::Single,
            OpticalMode::Adat,
        )
        .unwrap();
        let adat_5 = MOTU_V2_CAPTURE_LAYOUT.port_index("adat-5").unwrap();
        let toslink_1 = MOTU_V2_CAPTURE_LAYOUT.port_index("toslink-1").unwrap();
        assert!(layout.is_present(adat_5));
        assert!(!layout.is_present(toslink_1));
        // control, 10 analog and main, 2 spdif, 8 adat, midi, phones.
        assert_eq!(layout.present_count(), 23);
        assert_eq!(layout.offset(0), Some(0));
        assert_eq!(layout.offset(1), Some(6));
        assert_eq!(layout.offset(adat_5), Some(6 + 16 * 3));
        assert_eq!(layout.event_size(), 76);
        assert_eq!(layout.dbs(), 19);

        let layout = StreamLayout::new(
            &MOTU_V2_CAPTURE_LAYOUT,
            RateTier::Double,
            OpticalMode::Adat,
        )
        .unwrap();
        assert!(!layout.is_present(adat_5));
        assert!(layout.is_present(MOTU_V2_CAPTURE_LAYOUT.port_index("adat-4").unwrap()));
        assert_eq!(layout.present_count(), 19);

        let layout = StreamLayout::new(
            &MOTU_V2_CAPTURE_LAYOUT,
            RateTier::Quadruple,
            OpticalMode::Off,
        )
        .unwrap();
        assert_eq!(layout.present_count(), 12);
        assert_eq!(layout.event_size(), 40);
    }

    #[test]
    fn layout_unsupported_configuration() {
        assert_eq!(
            StreamLayout::new(&MOTU_V2_CAPTURE_LAYOUT, RateTier::Quadruple, OpticalMode::Adat),
            Err(IsochProtocolError::UnsupportedConfiguration)
        );
        assert_eq!(
            StreamLayout::new(&BEBOB_CAPTURE_LAYOUT, RateTier::Single, OpticalMode::Adat),
            Err(IsochProtocolError::UnsupportedConfiguration)
        );
    }

    #[test]
    fn demux_mux_round_trip() {
        let layout =
            StreamLayout::new(&BEBOB_CAPTURE_LAYOUT, RateTier::Single, OpticalMode::Off).unwrap();
        assert_eq!(layout.event_size(), 12);

        let events = 8;
        let mut cluster = vec![0u8; layout.event_size() * events];
        cluster
            .chunks_exact_mut(layout.event_size())
            .enumerate()
            .for_each(|(e, event)| {
                serialize_audio(e as i32 * 100, &mut event[0..4]);
                serialize_audio(-(e as i32), &mut event[4..8]);
                if e == 5 {
                    serialize_midi(&[0xf8], &mut event[8..12]);
                } else {
                    serialize_midi(&[], &mut event[8..12]);
                }
            });

        let mut recorder = Recorder::default();
        demux(&layout, &cluster, events, &mut recorder).unwrap();
        assert_eq!(recorder.0.len(), 3 * events);
        let (_, _, slot) = recorder.0.iter().find(|(i, e, _)| *i == 4 && *e == 0).unwrap();
        assert_eq!(slot, &[0x80, 0x00, 0x00, 0x00]);

        let mut rebuilt = vec![0xffu8; cluster.len()];
        mux(&layout, &mut rebuilt, events, &mut recorder).unwrap();
        assert_eq!(rebuilt, cluster);
    }

    #[test]
    fn mux_fills_absent_data() {
        let layout = StreamLayout::new(
            &BEBOB_CAPTURE_LAYOUT,
            RateTier::Single,
            OpticalMode::Toslink,
        )
        .unwrap();
        let mut cluster = vec![0xffu8; layout.event_size() * 2];
        let mut recorder = Recorder::default();
        mux(&layout, &mut cluster, 2, &mut recorder).unwrap();
        assert_eq!(
            &cluster[..layout.event_size()],
            &[
                0x40, 0, 0, 0, 0x40, 0, 0, 0, 0x40, 0, 0, 0, 0x40, 0, 0, 0, 0x80, 0, 0, 0
            ]
        );

        let layout =
            StreamLayout::new(&MOTU_V2_CAPTURE_LAYOUT, RateTier::Single, OpticalMode::Off).unwrap();
        let mut cluster = vec![0xffu8; layout.event_size()];
        mux(&layout, &mut cluster, 1, &mut recorder).unwrap();
        let midi = layout.offset(MOTU_V2_CAPTURE_LAYOUT.port_index("midi-1").unwrap()).unwrap();
        assert_eq!(&cluster[midi..(midi + 4)], &[0x80, 0, 0, 0]);
        assert!(cluster[..midi].iter().all(|&b| b == 0));
    }

    #[test]
    fn short_cluster_is_rejected() {
        let layout =
            StreamLayout::new(&BEBOB_CAPTURE_LAYOUT, RateTier::Single, OpticalMode::Off).unwrap();
        let cluster = vec![0u8; layout.event_size() * 8 - 1];
        let mut recorder = Recorder::default();
        assert_eq!(
            demux(&layout, &cluster, 8, &mut recorder),
            Err(IsochProtocolError::ShortPacket)
        );
        assert!(recorder.0.is_empty());
    }

    struct MidiCapture {
        midi: usize,
        parser: MidiParser,
        bytes: Vec<(usize, u8)>,
        msgs: Vec<MidiMessage>,
    }

    impl PortSink for MidiCapture {
        fn put_slot(&mut self, index: usize, event: usize, slot: &[u8]) {
            if index == self.midi {
                deserialize_midi(slot).iter().for_each(|&byte| {
                    self.bytes.push((event, byte));
                    if let Some(msg) = self.parser.feed(byte) {
                        self.msgs.push(msg);
                    }
                });
            }
        }
    }

    #[test]
    fn midi_status_in_third_event() {
        let layout =
            StreamLayout::new(&BEBOB_CAPTURE_LAYOUT, RateTier::Single, OpticalMode::Off).unwrap();
        let mut cluster = vec![0u8; layout.event_size() * 8];
        cluster
            .chunks_exact_mut(layout.event_size())
            .for_each(|event| serialize_midi(&[], &mut event[8..12]));
        let pos = layout.event_size() * 3 + 8;
        cluster[pos..(pos + 4)].copy_from_slice(&[0x81, 0x90, 0x00, 0x00]);

        let mut capture = MidiCapture {
            midi: BEBOB_CAPTURE_LAYOUT.port_index("midi-1").unwrap(),
            parser: MidiParser::default(),
            bytes: Vec::new(),
            msgs: Vec::new(),
        };
        demux(&layout, &cluster, 8, &mut capture).unwrap();
        assert_eq!(capture.bytes, vec![(3, 0x90)]);
        assert!(capture.msgs.is_empty());
        assert_eq!(capture.parser.state(), MidiParserState::AwaitingData1);
    }

    #[test]
    fn rate_tier() {
        assert_eq!(RateTier::from_rate(44100), Some(RateTier::Single));
        assert_eq!(RateTier::from_rate(96000), Some(RateTier::Double));
        assert_eq!(RateTier::from_rate(176400), Some(RateTier::Quadruple));
        assert_eq!(RateTier::from_rate(22050), None);
    }
}

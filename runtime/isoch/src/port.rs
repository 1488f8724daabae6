// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Ports of stream, the named views of slots in data block.
//!
//! The port consists of two halves. The processor half is owned by stream processor and touched
//! at demultiplexing or multiplexing. The application half is handed to the caller of
//! `add_port()`. The halves communicate via lock-free ring buffer.

use {
    firewire_isoch_protocols::{am824::*, layout::*, midi::*},
    rtrb::{Consumer, Producer, RingBuffer},
    std::sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

/// Counters and flags shared by both halves of port.
#[derive(Debug, Default)]
pub struct PortStats {
    enabled: AtomicBool,
    xruns: AtomicU64,
    frames: AtomicU64,
}

impl PortStats {
    /// Whether the port is present in the current configuration of stream.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// The number of slots lost due to overrun of capture port or underrun of playback port.
    pub fn xruns(&self) -> u64 {
        self.xruns.load(Ordering::Relaxed)
    }

    /// The number of slots transferred.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    fn count_xrun(&self) {
        self.xruns.fetch_add(1, Ordering::Relaxed);
    }

    fn count_frame(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }
}

enum PortIo {
    CaptureSamples(Producer<i32>),
    CaptureBytes(Producer<u8>),
    CaptureMidi {
        parser: MidiParser,
        messages: Producer<MidiMessage>,
    },
    PlaybackSamples(Consumer<i32>),
    PlaybackBytes(Consumer<u8>),
    PlaybackMidi {
        encoder: MidiEncoder,
        messages: Consumer<MidiMessage>,
    },
}

enum HandleIo {
    Samples(Consumer<i32>),
    Bytes(Consumer<u8>),
    Midi(Consumer<MidiMessage>),
    PlaybackSamples(Producer<i32>),
    PlaybackBytes(Producer<u8>),
    PlaybackMidi(Producer<MidiMessage>),
}

/// The half of port owned by stream processor.
pub(crate) struct Port {
    spec: &'static PortSpec,
    format: SampleFormat,
    io: PortIo,
    stats: Arc<PortStats>,
}

/// The half of port for application.
pub struct PortHandle {
    name: &'static str,
    kind: PortKind,
    width: usize,
    io: HandleIo,
    stats: Arc<PortStats>,
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("name", &self.spec.name)
            .field("format", &self.format)
            .field("stats", &self.stats)
            .finish()
    }
}

impl std::fmt::Debug for PortHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PortHandle")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("stats", &self.stats)
            .finish()
    }
}

/// Create both halves of port. The capacity is the number of slots for audio and control port,
/// and the number of messages for MIDI port.
pub(crate) fn create_port(
    spec: &'static PortSpec,
    direction: StreamDirection,
    format: SampleFormat,
    capacity: usize,
) -> (Port, PortHandle) {
    let (io, handle_io) = match (direction, spec.kind) {
        (StreamDirection::Capture, PortKind::Audio) => {
            let (p, c) = RingBuffer::new(capacity);
            (PortIo::CaptureSamples(p), HandleIo::Samples(c))
        }
        (StreamDirection::Capture, PortKind::Control) => {
            let (p, c) = RingBuffer::new(capacity * spec.width);
            (PortIo::CaptureBytes(p), HandleIo::Bytes(c))
        }
        (StreamDirection::Capture, PortKind::Midi) => {
            let (p, c) = RingBuffer::new(capacity);
            let io = PortIo::CaptureMidi {
                parser: Default::default(),
                messages: p,
            };
            (io, HandleIo::Midi(c))
        }
        (StreamDirection::Playback, PortKind::Audio) => {
            let (p, c) = RingBuffer::new(capacity);
            (PortIo::PlaybackSamples(c), HandleIo::PlaybackSamples(p))
        }
        (StreamDirection::Playback, PortKind::Control) => {
            let (p, c) = RingBuffer::new(capacity * spec.width);
            (PortIo::PlaybackBytes(c), HandleIo::PlaybackBytes(p))
        }
        (StreamDirection::Playback, PortKind::Midi) => {
            let (p, c) = RingBuffer::new(capacity);
            let io = PortIo::PlaybackMidi {
                encoder: Default::default(),
                messages: c,
            };
            (io, HandleIo::PlaybackMidi(p))
        }
    };

    let stats = Arc::new(PortStats::default());

    let port = Port {
        spec,
        format,
        io,
        stats: stats.clone(),
    };
    let handle = PortHandle {
        name: spec.name,
        kind: spec.kind,
        width: spec.width,
        io: handle_io,
        stats,
    };

    (port, handle)
}

impl Port {
    pub(crate) fn name(&self) -> &'static str {
        self.spec.name
    }

    pub(crate) fn stats(&self) -> &Arc<PortStats> {
        &self.stats
    }

    pub(crate) fn midi_parser_state(&self) -> Option<MidiParserState> {
        match &self.io {
            PortIo::CaptureMidi { parser, .. } => Some(parser.state()),
            _ => None,
        }
    }

    /// Deliver the slot of capture stream.
    pub(crate) fn put_slot(&mut self, slot: &[u8]) {
        match &mut self.io {
            PortIo::CaptureSamples(producer) => {
                let sample = match self.format {
                    SampleFormat::Am824 => deserialize_audio(slot),
                    SampleFormat::Raw24 => deserialize_raw24(slot),
                };
                if producer.push(sample).is_err() {
                    self.stats.count_xrun();
                    return;
                }
            }
            PortIo::CaptureBytes(producer) => {
                if producer.slots() < slot.len() {
                    self.stats.count_xrun();
                    return;
                }
                slot.iter().for_each(|&b| {
                    let _ = producer.push(b);
                });
            }
            PortIo::CaptureMidi { parser, messages } => {
                let stats = &self.stats;
                parser.feed_bytes(deserialize_midi(slot), |msg| {
                    if messages.push(msg).is_err() {
                        stats.count_xrun();
                    }
                });
            }
            _ => return,
        }
        self.stats.count_frame();
    }

    /// Fill the slot of playback stream. False means that no data is available, then the slot
    /// should be filled with the value to express no data. The slot of MIDI port is filled only
    /// when the data block is assigned to the port in multiplexing.
    pub(crate) fn get_slot(&mut self, slot: &mut [u8], midi_turn: bool) -> bool {
        match &mut self.io {
            PortIo::PlaybackSamples(consumer) => match consumer.pop() {
                Ok(sample) => match self.format {
                    SampleFormat::Am824 => serialize_audio(sample, slot),
                    SampleFormat::Raw24 => serialize_raw24(sample, slot),
                },
                Err(_) => {
                    self.stats.count_xrun();
                    return false;
                }
            },
            PortIo::PlaybackBytes(consumer) => {
                if consumer.slots() < slot.len() {
                    self.stats.count_xrun();
                    return false;
                }
                slot.iter_mut().for_each(|b| {
                    if let Ok(val) = consumer.pop() {
                        *b = val;
                    }
                });
            }
            PortIo::PlaybackMidi { encoder, messages } => {
                if !midi_turn {
                    return false;
                }
                // Pull messages as many as the encoder accepts.
                while let Ok(msg) = messages.peek() {
                    if !encoder.push(msg) {
                        break;
                    }
                    let _ = messages.pop();
                }
                encoder.build_slot(slot);
            }
            _ => return false,
        }
        self.stats.count_frame();
        true
    }
}

impl PortHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> PortKind {
        self.kind
    }

    /// The number of bytes in data block.
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn stats(&self) -> &Arc<PortStats> {
        &self.stats
    }

    pub fn is_enabled(&self) -> bool {
        self.stats.is_enabled()
    }

    /// The number of samples, bytes, or messages available to read, or the space to write.
    pub fn available(&self) -> usize {
        match &self.io {
            HandleIo::Samples(c) => c.slots(),
            HandleIo::Bytes(c) => c.slots(),
            HandleIo::Midi(c) => c.slots(),
            HandleIo::PlaybackSamples(p) => p.slots(),
            HandleIo::PlaybackBytes(p) => p.slots(),
            HandleIo::PlaybackMidi(p) => p.slots(),
        }
    }

    /// Read captured samples, then return the number of read samples.
    pub fn read_samples(&mut self, samples: &mut [i32]) -> usize {
        match &mut self.io {
            HandleIo::Samples(consumer) => read_from(consumer, samples),
            _ => 0,
        }
    }

    /// Write samples to playback, then return the number of written samples.
    pub fn write_samples(&mut self, samples: &[i32]) -> usize {
        match &mut self.io {
            HandleIo::PlaybackSamples(producer) => write_into(producer, samples),
            _ => 0,
        }
    }

    /// Read captured bytes of control port.
    pub fn read_bytes(&mut self, bytes: &mut [u8]) -> usize {
        match &mut self.io {
            HandleIo::Bytes(consumer) => read_from(consumer, bytes),
            _ => 0,
        }
    }

    /// Write bytes of control port to playback.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> usize {
        match &mut self.io {
            HandleIo::PlaybackBytes(producer) => write_into(producer, bytes),
            _ => 0,
        }
    }

    /// Read the complete MIDI message captured.
    pub fn read_midi(&mut self) -> Option<MidiMessage> {
        match &mut self.io {
            HandleIo::Midi(consumer) => consumer.pop().ok(),
            _ => None,
        }
    }

    /// Write the complete MIDI message to playback. False means no space.
    pub fn write_midi(&mut self, msg: &MidiMessage) -> bool {
        match &mut self.io {
            HandleIo::PlaybackMidi(producer) => producer.push(*msg).is_ok(),
            _ => false,
        }
    }
}

fn read_from<T: Copy>(consumer: &mut Consumer<T>, buf: &mut [T]) -> usize {
    let count = buf.len().min(consumer.slots());
    match consumer.read_chunk(count) {
        Ok(chunk) => {
            let (first, second) = chunk.as_slices();
            buf[..first.len()].copy_from_slice(first);
            buf[first.len()..count].copy_from_slice(second);
            chunk.commit_all();
            count
        }
        Err(_) => 0,
    }
}

fn write_into<T: Copy + Default>(producer: &mut Producer<T>, buf: &[T]) -> usize {
    let count = buf.len().min(producer.slots());
    match producer.write_chunk(count) {
        Ok(mut chunk) => {
            let (first, second) = chunk.as_mut_slices();
            let pos = first.len();
            first.copy_from_slice(&buf[..pos]);
            second.copy_from_slice(&buf[pos..count]);
            chunk.commit_all();
            count
        }
        Err(_) => 0,
    }
}

// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! In-process emulation of isochronous layer of IEEE 1394 bus.
//!
//! The bus has its own cycle counter advanced by the caller, the allocation of 64 channels, and
//! generation incremented at bus reset. The packet transmitted in the channel is delivered to
//! the contexts receiving packets in the channel. The bus plays the role of kernel driver, thus
//! it allocates memory to store packets in flight.

use {
    super::{iso_handler::*, iso_stream::*},
    firewire_isoch_protocols::{cycle_time::CycleTime, IsochStreamError},
    glib::Error,
    std::{
        collections::VecDeque,
        sync::{Arc, Condvar, Mutex, MutexGuard},
        time::{Duration, Instant},
    },
    tracing::debug,
};

/// The number of isochronous channels in the bus.
pub const CHANNEL_COUNT: usize = 64;

/// The maximum number of packets in flight for each channel.
pub const LOOPBACK_QUEUE_DEPTH: usize = 512;

#[derive(Debug)]
struct LoopbackPacket {
    cycle: u64,
    tag: u8,
    sy: u8,
    data: Vec<u8>,
}

#[derive(Debug)]
struct BusState {
    cycles: u64,
    generation: u32,
    allocated: u64,
    queues: Vec<VecDeque<LoopbackPacket>>,
    overruns: Vec<u64>,
}

#[derive(Debug)]
struct BusInner {
    state: Mutex<BusState>,
    cond: Condvar,
}

/// The emulated bus. The instance is cheap to clone and shares the state.
#[derive(Debug, Clone)]
pub struct LoopbackBus {
    inner: Arc<BusInner>,
}

impl Default for LoopbackBus {
    fn default() -> Self {
        let state = BusState {
            cycles: 0,
            generation: 0,
            allocated: 0,
            queues: (0..CHANNEL_COUNT).map(|_| VecDeque::new()).collect(),
            overruns: vec![0; CHANNEL_COUNT],
        };
        Self {
            inner: Arc::new(BusInner {
                state: Mutex::new(state),
                cond: Condvar::new(),
            }),
        }
    }
}

fn channel_unavailable(channel: u8) -> Error {
    let msg = format!("Isochronous channel {} is not available", channel);
    Error::new(IsochStreamError::ChannelUnavailable, &msg)
}

impl LoopbackBus {
    fn state(&self) -> MutexGuard<'_, BusState> {
        // The state is consistent at any point of panic.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Advance the cycle counter, then wake up contexts.
    pub fn advance_cycles(&self, cycles: u64) {
        self.state().cycles += cycles;
        self.inner.cond.notify_all();
    }

    /// The number of cycles since the bus is created.
    pub fn cycles(&self) -> u64 {
        self.state().cycles
    }

    pub fn cycle_time(&self) -> CycleTime {
        CycleTime::from_cycles(self.cycles())
    }

    /// Generate bus reset. Any allocation of channel and any packet in flight are discarded,
    /// and existent contexts are expired.
    pub fn reset(&self) {
        {
            let mut state = self.state();
            state.generation += 1;
            state.allocated = 0;
            state.queues.iter_mut().for_each(|queue| queue.clear());
            debug!(generation = state.generation, "bus reset");
        }
        self.inner.cond.notify_all();
    }

    /// The number of packets discarded due to the depth of queue.
    pub fn overruns(&self, channel: u8) -> u64 {
        self.state()
            .overruns
            .get(channel as usize)
            .copied()
            .unwrap_or_default()
    }
}

impl IsoContextProvider for LoopbackBus {
    type Context = LoopbackContext;

    fn generation(&self) -> u32 {
        self.state().generation
    }

    fn allocate_channel(&self, channel: Option<u8>) -> Result<u8, Error> {
        let mut state = self.state();
        let channel = match channel {
            Some(ch) if (ch as usize) < CHANNEL_COUNT && state.allocated & (1 << ch) == 0 => ch,
            Some(ch) => Err(channel_unavailable(ch))?,
            None => (0..CHANNEL_COUNT as u8)
                .find(|ch| state.allocated & (1 << ch) == 0)
                .ok_or_else(|| {
                    Error::new(IsochStreamError::ChannelUnavailable, "No channel is available")
                })?,
        };
        state.allocated |= 1 << channel;
        Ok(channel)
    }

    fn release_channel(&self, channel: u8) {
        if (channel as usize) < CHANNEL_COUNT {
            self.state().allocated &= !(1 << channel);
        }
    }

    fn create_context(
        &self,
        direction: IsoDirection,
        channel: u8,
        irq_interval: usize,
        max_packet_size: usize,
    ) -> Result<LoopbackContext, Error> {
        if channel as usize >= CHANNEL_COUNT {
            Err(channel_unavailable(channel))?;
        }
        if irq_interval == 0 || max_packet_size == 0 {
            let msg = format!(
                "Invalid parameters of context: interval {}, size {}",
                irq_interval, max_packet_size
            );
            Err(Error::new(IsochStreamError::ContextFailed, &msg))?;
        }

        let state = self.state();
        if direction == IsoDirection::Transmit && state.allocated & (1 << channel) == 0 {
            Err(channel_unavailable(channel))?;
        }

        Ok(LoopbackContext {
            bus: self.clone(),
            direction,
            channel,
            generation: state.generation,
            irq_interval: irq_interval as u64,
            next_cycle: state.cycles,
            overruns: state.overruns[channel as usize],
            running: false,
            buf: vec![0; max_packet_size],
            batch: Vec::with_capacity(irq_interval),
        })
    }
}

/// The context of isochronous layer in the emulated bus.
#[derive(Debug)]
pub struct LoopbackContext {
    bus: LoopbackBus,
    direction: IsoDirection,
    channel: u8,
    generation: u32,
    irq_interval: u64,
    next_cycle: u64,
    overruns: u64,
    running: bool,
    buf: Vec<u8>,
    batch: Vec<LoopbackPacket>,
}

impl LoopbackContext {
    fn is_ready(&self, state: &BusState) -> bool {
        match self.direction {
            IsoDirection::Transmit => state.cycles >= self.next_cycle + self.irq_interval,
            IsoDirection::Receive => !state.queues[self.channel as usize].is_empty(),
        }
    }

    fn transmit(&mut self, stream: &mut IsoTransmitStream) -> Result<usize, IsochStreamError> {
        let now = {
            let state = self.bus.state();
            if state.generation != self.generation {
                Err(IsochStreamError::BusReset)?;
            }
            state.cycles
        };

        let mut stop = false;
        while self.next_cycle < now && !stop {
            let cycle_time = CycleTime::from_cycles(self.next_cycle);
            let (disposition, info) = stream.get_packet(&mut self.buf, &cycle_time, 0);
            self.batch.push(LoopbackPacket {
                cycle: self.next_cycle,
                tag: info.tag,
                sy: info.sy,
                data: self.buf[..info.length].to_vec(),
            });
            self.next_cycle += 1;
            stop = disposition == IsoDisposition::Stop;
        }

        let count = self.batch.len();
        {
            let mut state = self.bus.state();
            if state.generation != self.generation {
                self.batch.clear();
                Err(IsochStreamError::BusReset)?;
            }
            let ch = self.channel as usize;
            self.batch.drain(..).for_each(|packet| {
                if state.queues[ch].len() >= LOOPBACK_QUEUE_DEPTH {
                    state.queues[ch].pop_front();
                    state.overruns[ch] += 1;
                }
                state.queues[ch].push_back(packet);
            });
        }
        self.bus.inner.cond.notify_all();

        if stop {
            Err(IsochStreamError::InvalidState)
        } else {
            Ok(count)
        }
    }

    fn receive(&mut self, stream: &mut IsoReceiveStream) -> Result<usize, IsochStreamError> {
        let dropped = {
            let mut state = self.bus.state();
            if state.generation != self.generation {
                Err(IsochStreamError::BusReset)?;
            }
            let ch = self.channel as usize;
            let queue = &mut state.queues[ch];
            self.batch.extend(queue.drain(..));
            let dropped = state.overruns[ch] - self.overruns;
            self.overruns = state.overruns[ch];
            dropped
        };

        let count = self.batch.len();
        let mut dropped = dropped as u32;
        let mut stop = false;
        self.batch.drain(..).for_each(|packet| {
            if !stop {
                let cycle_time = CycleTime::from_cycles(packet.cycle);
                let disposition = stream.put_packet(
                    &packet.data,
                    self.channel,
                    packet.tag,
                    packet.sy,
                    &cycle_time,
                    dropped,
                );
                dropped = 0;
                stop = disposition == IsoDisposition::Stop;
            }
        });

        if stop {
            Err(IsochStreamError::InvalidState)
        } else {
            Ok(count)
        }
    }
}

impl IsoContext for LoopbackContext {
    fn direction(&self) -> IsoDirection {
        self.direction
    }

    fn channel(&self) -> u8 {
        self.channel
    }

    fn start(&mut self) -> Result<(), IsochStreamError> {
        let state = self.bus.state();
        if state.generation != self.generation {
            Err(IsochStreamError::BusReset)?;
        }
        if self.direction == IsoDirection::Transmit {
            self.next_cycle = state.cycles;
        }
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn wait(&mut self, timeout: Duration) -> Result<(), IsochStreamError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.bus.state();
        loop {
            if state.generation != self.generation {
                Err(IsochStreamError::BusReset)?;
            }
            if self.is_ready(&state) {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            state = match self.bus.inner.cond.wait_timeout(state, deadline - now) {
                Ok((state, _)) => state,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        Ok(())
    }

    fn process(&mut self, stream: &mut IsoStream) -> Result<usize, IsochStreamError> {
        if !self.running {
            Err(IsochStreamError::InvalidState)?;
        }

        match (self.direction, stream) {
            (IsoDirection::Transmit, IsoStream::Transmit(s)) => self.transmit(s),
            (IsoDirection::Receive, IsoStream::Receive(s)) => self.receive(s),
            _ => Err(IsochStreamError::InvalidState),
        }
    }
}

#[cfg(test)]
mod test {
    use {super::*, crate::packet_buffer::*, firewire_isoch_protocols::cip::*};

    fn open_pair(
        manager: &mut IsoHandlerManager<LoopbackBus>,
        capacity: usize,
    ) -> (PacketProducer, PacketConsumer, usize, usize) {
        let (tx_producer, tx_consumer) = PacketBuffer::new(ISO_HEADER_SIZE, capacity, 64).unwrap();
        let (rx_producer, rx_consumer) = PacketBuffer::new(ISO_HEADER_SIZE, capacity, 64).unwrap();

        let tx_stream = IsoStream::Transmit(IsoTransmitStream::new(0, tx_consumer, 1, 2));
        let tx_id = manager.open("tx", tx_stream, Some(3), 4, 64).unwrap();
        let channel = manager.channel(tx_id);
        let rx_stream = IsoStream::Receive(IsoReceiveStream::new(0, rx_producer));
        let rx_id = manager.open("rx", rx_stream, channel, 4, 64).unwrap();

        (tx_producer, rx_consumer, tx_id, rx_id)
    }

    fn queue_data_packet(producer: &mut PacketProducer, dbc: u8, syt: u16) {
        // 4 data blocks of 8 bytes.
        let mut packet = [0; 40];
        CipHeader::am824(1, 2, dbc, 2, syt).build(&mut packet).unwrap();
        let header = build_iso_header(&CycleTime::default(), ISO_TAG_CIP, 0);
        producer.add_packet(&header, &packet).unwrap();
    }

    #[test]
    fn channel_allocation() {
        let bus = LoopbackBus::default();
        assert_eq!(bus.allocate_channel(Some(5)).unwrap(), 5);
        let err = bus.allocate_channel(Some(5)).unwrap_err();
        assert_eq!(
            err.kind::<IsochStreamError>(),
            Some(IsochStreamError::ChannelUnavailable)
        );
        assert_eq!(bus.allocate_channel(None).unwrap(), 0);
        bus.release_channel(5);
        assert_eq!(bus.allocate_channel(Some(5)).unwrap(), 5);

        assert!(bus.allocate_channel(Some(64)).is_err());

        // Transmission requires allocation.
        assert!(bus
            .create_context(IsoDirection::Transmit, 7, 8, 64)
            .is_err());
        assert!(bus.create_context(IsoDirection::Receive, 7, 8, 64).is_ok());

        bus.reset();
        assert_eq!(bus.allocate_channel(Some(5)).unwrap(), 5);
    }

    #[test]
    fn open_failure_leaves_nothing() {
        let bus = LoopbackBus::default();
        let mut manager = IsoHandlerManager::new(bus.clone());

        let (_, consumer) = PacketBuffer::new(ISO_HEADER_SIZE, 4, 64).unwrap();
        let stream = IsoStream::Transmit(IsoTransmitStream::new(0, consumer, 1, 2));
        // Zero size of packet fails to create context.
        assert!(manager.open("tx", stream, Some(2), 4, 0).is_err());
        // The channel is released.
        assert_eq!(bus.allocate_channel(Some(2)).unwrap(), 2);
        assert_eq!(manager.channel(0), None);

        let (producer, _) = PacketBuffer::new(ISO_HEADER_SIZE, 4, 64).unwrap();
        let stream = IsoStream::Receive(IsoReceiveStream::new(0, producer));
        assert!(manager.open("rx", stream, None, 4, 64).is_err());
    }

    #[test]
    fn loopback_delivers_packets_in_order() {
        let bus = LoopbackBus::default();
        let mut manager = IsoHandlerManager::new(bus.clone());
        let (mut tx_producer, mut rx_consumer, tx_id, rx_id) = open_pair(&mut manager, 16);
        assert_eq!(manager.channel(tx_id), Some(3));
        assert_eq!(manager.channel(rx_id), Some(3));

        (0..4u8).for_each(|i| queue_data_packet(&mut tx_producer, i * 4, i as u16));

        // The contexts start at the first iteration.
        assert_eq!(manager.iterate().unwrap(), 0);
        bus.advance_cycles(6);
        assert_eq!(manager.iterate().unwrap(), 6 + 6);

        let mut header = [0; ISO_HEADER_SIZE];
        let mut buf = [0; 64];
        let mut packets = Vec::new();
        while let Ok(len) = rx_consumer.get_next_packet(&mut header, &mut buf) {
            let (cycle, tag, _) = parse_iso_header(&header);
            assert_eq!(tag, ISO_TAG_CIP);
            packets.push((cycle, CipHeader::parse(&buf[..len]).unwrap()));
        }
        assert_eq!(packets.len(), 6);
        packets.iter().enumerate().for_each(|(i, (cycle, header))| {
            assert_eq!(cycle, &CycleTime::from_cycles(i as u64));
            if i < 4 {
                assert_eq!(header.syt, i as u16);
                assert_eq!(header.dbc, i as u8 * 4);
            } else {
                // The packets without data continue the counter.
                assert!(header.is_no_data());
                assert_eq!(header.dbc, 16);
            }
        });

        let tx_stats = manager.stats(tx_id).unwrap().snapshot();
        assert_eq!(tx_stats.packets, 6);
        assert_eq!(tx_stats.no_data, 2);
        let rx_stats = manager.stats(rx_id).unwrap().snapshot();
        assert_eq!(rx_stats.packets, 6);
        assert_eq!(rx_stats.dropped, 0);
    }

    #[test]
    fn bus_reset_recovery() {
        let bus = LoopbackBus::default();
        let mut manager = IsoHandlerManager::new(bus.clone());
        let (_tx_producer, mut rx_consumer, tx_id, _rx_id) = open_pair(&mut manager, 16);

        assert_eq!(manager.iterate().unwrap(), 0);
        bus.advance_cycles(2);
        assert_eq!(manager.iterate().unwrap(), 4);

        bus.reset();
        bus.advance_cycles(2);
        // The expiration of generation is detected, then the manager recovers.
        assert_eq!(manager.iterate().unwrap(), 0);
        assert_eq!(manager.bus_resets(), 1);
        assert_eq!(manager.channel(tx_id), Some(3));
        assert!(bus.allocate_channel(Some(3)).is_err());

        // The contexts start again at the current cycle.
        assert_eq!(manager.iterate().unwrap(), 0);
        bus.advance_cycles(3);
        assert_eq!(manager.iterate().unwrap(), 6);

        let mut header = [0; ISO_HEADER_SIZE];
        let mut buf = [0; 64];
        let mut cycles = Vec::new();
        while rx_consumer.get_next_packet(&mut header, &mut buf).is_ok() {
            cycles.push(parse_iso_header(&header).0);
        }
        assert_eq!(
            cycles,
            vec![
                CycleTime::from_cycles(0),
                CycleTime::from_cycles(1),
                CycleTime::from_cycles(4),
                CycleTime::from_cycles(5),
                CycleTime::from_cycles(6),
            ]
        );
    }

    #[test]
    fn bus_reset_renumbers_channel() {
        let bus = LoopbackBus::default();
        let mut manager = IsoHandlerManager::new(bus.clone());
        let (_tx_producer, mut rx_consumer, tx_id, rx_id) = open_pair(&mut manager, 16);

        assert_eq!(manager.iterate().unwrap(), 0);
        bus.advance_cycles(2);
        assert_eq!(manager.iterate().unwrap(), 4);

        // The other node takes the channel in the new generation.
        bus.reset();
        assert_eq!(bus.allocate_channel(Some(3)).unwrap(), 3);
        bus.advance_cycles(2);
        assert_eq!(manager.iterate().unwrap(), 0);
        assert_eq!(manager.bus_resets(), 1);
        assert_eq!(manager.channel(tx_id), Some(0));
        assert_eq!(manager.channel(rx_id), Some(0));

        assert_eq!(manager.iterate().unwrap(), 0);
        bus.advance_cycles(3);
        assert_eq!(manager.iterate().unwrap(), 6);

        let mut header = [0; ISO_HEADER_SIZE];
        let mut buf = [0; 64];
        let mut count = 0;
        while rx_consumer.get_next_packet(&mut header, &mut buf).is_ok() {
            count += 1;
        }
        assert_eq!(count, 2 + 3);
        assert_eq!(manager.stats(rx_id).unwrap().snapshot().dropped, 0);
    }

    #[test]
    fn threaded_handlers() {
        let bus = LoopbackBus::default();
        let mut manager = IsoHandlerManager::new(bus.clone());
        let (_tx_producer, mut rx_consumer, _tx_id, rx_id) = open_pair(&mut manager, 64);

        manager.start().unwrap();
        assert!(manager.is_running());

        let stats = manager.stats(rx_id).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while stats.packets() < 32 {
            assert!(Instant::now() < deadline);
            bus.advance_cycles(1);
            std::thread::sleep(Duration::from_micros(100));
        }

        // Bus reset is recovered with events from threads.
        bus.reset();
        let deadline = Instant::now() + Duration::from_secs(10);
        while manager.bus_resets() == 0 {
            assert!(Instant::now() < deadline);
            manager.poll_events().unwrap();
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(manager.is_running());

        manager.stop().unwrap();
        let count = stats.packets();
        bus.advance_cycles(100);
        std::thread::sleep(Duration::from_millis(20));
        // No callback after stop.
        assert_eq!(stats.packets(), count);

        let mut header = [0; ISO_HEADER_SIZE];
        let mut buf = [0; 64];
        assert!(rx_consumer.get_next_packet(&mut header, &mut buf).is_ok());
    }
}

// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Runtime of the service to monitor SYT in packet streaming over the loopback bus.
//!
//! The engine transmits the stream of playback layout with test signal, receives the same
//! stream in the other handler, then verifies the signal and the timestamps. The runtime drives
//! the engine by events from the dispatchers of signal and timer.

use {
    super::{
        device::*, iso_handler::*, iso_stream::*, loopback::*, packet_buffer::*, port::*,
        stream_processor::*,
    },
    clap::ValueEnum,
    firewire_isoch_protocols::{cycle_time::*, layout::*, midi::MidiMessage},
    glib::Error,
    nix::sys::signal,
    runtime_core::{dispatcher::*, *},
    std::{
        sync::mpsc,
        time::{Duration, Instant},
    },
    tracing::{debug, debug_span, info, warn},
};

/// The model of device in the bus.
#[derive(ValueEnum, Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeviceModel {
    /// MOTU models with version 2 protocol.
    MotuV2,
    /// BeBoB models with AM824 data channels.
    Bebob,
}

impl Default for DeviceModel {
    fn default() -> Self {
        Self::MotuV2
    }
}

/// The mode of optical interface given by command line.
#[derive(ValueEnum, Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpticalIface {
    Off,
    Adat,
    Toslink,
}

impl Default for OpticalIface {
    fn default() -> Self {
        Self::Off
    }
}

impl From<OpticalIface> for OpticalMode {
    fn from(iface: OpticalIface) -> Self {
        match iface {
            OpticalIface::Off => OpticalMode::Off,
            OpticalIface::Adat => OpticalMode::Adat,
            OpticalIface::Toslink => OpticalMode::Toslink,
        }
    }
}

/// The parameters of monitor service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorParams {
    pub model: DeviceModel,
    pub config: StreamConfig,
    /// Stop after the duration when given.
    pub duration: Option<Duration>,
    /// Generate bus reset periodically when given.
    pub bus_reset_interval: Option<Duration>,
    pub report_interval: Duration,
}

impl Default for MonitorParams {
    fn default() -> Self {
        Self {
            model: Default::default(),
            config: Default::default(),
            duration: None,
            bus_reset_interval: None,
            report_interval: Duration::from_secs(1),
        }
    }
}

/// The node ID of host in the source field of CIP header.
const HOST_NODE_ID: u8 = 0;

/// The period of ramp signal.
const SIGNAL_PERIOD: i32 = 0x10000;

/// The offset of ramp signal between ports.
const SIGNAL_PORT_OFFSET: i32 = 0x1000;

/// Statistics of verification for captured signal.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SignalStats {
    /// The number of samples following the previous one.
    pub verified: u64,
    /// The number of samples not following the previous one.
    pub glitches: u64,
}

#[derive(Debug, Default)]
struct SignalChecker {
    next: Option<i32>,
    stats: SignalStats,
}

impl SignalChecker {
    fn check(&mut self, samples: &[i32]) {
        samples.iter().for_each(|&sample| {
            match self.next {
                Some(next) if next == sample => self.stats.verified += 1,
                Some(_) => self.stats.glitches += 1,
                None => (),
            }
            self.next = Some((sample + 1) % SIGNAL_PERIOD);
        });
    }
}

/// Statistics of MIDI messages in the loopback.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct MidiStats {
    pub sent: u64,
    pub received: u64,
    /// The number of received messages different from the sent one.
    pub mismatches: u64,
}

fn note_on(note: u8) -> MidiMessage {
    MidiMessage::new(&[0x90, note & 0x7f, 0x40])
}

/// The engine to transmit and receive the stream over the loopback bus.
pub struct MonitorEngine {
    device: Box<dyn StreamingDevice>,
    bus: LoopbackBus,
    manager: IsoHandlerManager<LoopbackBus>,
    tx: TransmitStreamProcessor,
    rx: ReceiveStreamProcessor,
    outputs: Vec<(PortHandle, i32)>,
    inputs: Vec<(PortHandle, SignalChecker)>,
    midi_ports: Option<(PortHandle, PortHandle)>,
    midi: MidiStats,
    scratch: Vec<i32>,
    started: bool,
}

impl MonitorEngine {
    pub fn new(params: &MonitorParams) -> Result<Self, Error> {
        let mut device: Box<dyn StreamingDevice> = match params.model {
            DeviceModel::MotuV2 => Box::new(MotuV2Device::new(MotuV2Device::default_image())),
            DeviceModel::Bebob => Box::new(BebobDevice::default()),
        };

        // Prepare processors in the current configuration of device, then switch it.
        let current = StreamConfig {
            rate: device.read_rate()?,
            optical: device.read_optical_mode()?,
            ..params.config
        };
        let size = max_packet_size(device.playback_layout());
        let (tx_producer, tx_consumer) =
            PacketBuffer::new(ISO_HEADER_SIZE, params.config.buffer_packets, size)?;
        let (rx_producer, rx_consumer) =
            PacketBuffer::new(ISO_HEADER_SIZE, params.config.buffer_packets, size)?;
        let mut tx = device.create_transmit_processor(&current, HOST_NODE_ID, tx_producer)?;
        let mut rx = device.create_monitor_processor(&current, rx_consumer)?;

        let config = &params.config;
        reconfigure(device.as_mut(), &mut rx, &mut tx, config.rate, config.optical)?;

        let bus = LoopbackBus::default();
        let mut manager = IsoHandlerManager::new(bus.clone());

        let stream = IsoTransmitStream::new(0, tx_consumer, HOST_NODE_ID, tx.layout().dbs());
        let tx_id = manager.open(
            "playback",
            IsoStream::Transmit(stream),
            None,
            config.irq_interval,
            size,
        )?;
        // The channel is allocated for transmission.
        let channel = manager.channel(tx_id);
        let stream = IsoReceiveStream::new(0, rx_producer);
        manager.open(
            "loopback",
            IsoStream::Receive(stream),
            channel,
            config.irq_interval,
            size,
        )?;

        let mut outputs = Vec::new();
        let mut inputs = Vec::new();
        let mut midi_ports = None;
        let mut offset = 0;
        for port in device.playback_layout().ports {
            match port.kind {
                PortKind::Audio => {
                    let output = tx.add_port(port.name, config.port_capacity)?;
                    let input = rx.add_port(port.name, config.port_capacity)?;
                    outputs.push((output, offset));
                    inputs.push((input, SignalChecker::default()));
                    offset = (offset + SIGNAL_PORT_OFFSET) % SIGNAL_PERIOD;
                }
                PortKind::Midi if midi_ports.is_none() => {
                    let output = tx.add_port(port.name, config.port_capacity)?;
                    let input = rx.add_port(port.name, config.port_capacity)?;
                    midi_ports = Some((output, input));
                }
                _ => (),
            }
        }

        debug!(
            device = device.name(),
            ?channel,
            rate = config.rate,
            optical = ?config.optical,
            ports = outputs.len(),
            "prepared"
        );

        Ok(Self {
            device,
            bus,
            manager,
            tx,
            rx,
            outputs,
            inputs,
            midi_ports,
            midi: Default::default(),
            scratch: vec![0; config.port_capacity],
            started: false,
        })
    }

    pub fn device(&self) -> &dyn StreamingDevice {
        self.device.as_ref()
    }

    pub fn bus(&self) -> &LoopbackBus {
        &self.bus
    }

    pub fn transmit_processor(&self) -> &TransmitStreamProcessor {
        &self.tx
    }

    pub fn receive_processor(&self) -> &ReceiveStreamProcessor {
        &self.rx
    }

    pub fn bus_resets(&self) -> u64 {
        self.manager.bus_resets()
    }

    /// The sum of statistics for all captured ports.
    pub fn signal_stats(&self) -> SignalStats {
        self.inputs
            .iter()
            .fold(SignalStats::default(), |mut stats, (_, checker)| {
                stats.verified += checker.stats.verified;
                stats.glitches += checker.stats.glitches;
                stats
            })
    }

    pub fn midi_stats(&self) -> &MidiStats {
        &self.midi
    }

    /// Start streaming. When threaded, each handler runs in dedicated thread, else the handlers
    /// are iterated by the call of step.
    pub fn start(&mut self, threaded: bool) -> Result<(), Error> {
        if threaded {
            self.manager.start()?;
        } else {
            // The contexts start at the first iteration.
            self.manager.iterate()?;
        }

        self.feed_ports();
        self.tx.start(self.bus.cycles());
        self.tx.fill()?;
        self.started = true;

        Ok(())
    }

    /// Advance the cycle of bus, then process packets. Return the number of received packets.
    pub fn step(&mut self, cycles: u64) -> Result<usize, Error> {
        self.bus.advance_cycles(cycles);

        self.feed_ports();
        if self.tx.is_running() {
            self.tx.fill()?;
        }

        if self.manager.is_running() {
            self.manager.poll_events()?;
        } else if self.started {
            self.manager.iterate()?;
        }

        let count = self.rx.process();
        self.drain_ports();

        Ok(count)
    }

    pub fn inject_bus_reset(&mut self) {
        warn!("inject bus reset");
        self.bus.reset();
    }

    /// Stop streaming. The handlers stop at first, then the processors.
    pub fn stop(&mut self) -> Result<(), Error> {
        self.manager.stop()?;
        self.tx.stop();
        self.started = false;

        self.rx.process();
        self.drain_ports();

        Ok(())
    }

    fn feed_ports(&mut self) {
        for (port, pos) in self.outputs.iter_mut() {
            let count = port.available().min(self.scratch.len());
            self.scratch[..count].iter_mut().for_each(|sample| {
                *sample = *pos;
                *pos = (*pos + 1) % SIGNAL_PERIOD;
            });
            port.write_samples(&self.scratch[..count]);
        }

        if let Some((output, _)) = &mut self.midi_ports {
            if output.is_enabled() && output.available() > 0 {
                let msg = note_on(self.midi.sent as u8);
                if output.write_midi(&msg) {
                    self.midi.sent += 1;
                }
            }
        }
    }

    fn drain_ports(&mut self) {
        for (port, checker) in self.inputs.iter_mut() {
            loop {
                let count = port.read_samples(&mut self.scratch);
                if count == 0 {
                    break;
                }
                checker.check(&self.scratch[..count]);
            }
        }

        if let Some((_, input)) = &mut self.midi_ports {
            while let Some(msg) = input.read_midi() {
                if msg != note_on(self.midi.received as u8) {
                    self.midi.mismatches += 1;
                }
                self.midi.received += 1;
            }
        }
    }

    /// Log summary of statistics.
    pub fn report(&self) {
        let rx = self.rx.stats();
        let tx = self.tx.stats();
        let signal = self.signal_stats();
        info!(
            device = self.device.name(),
            cycle_time = %self.bus.cycle_time(),
            tx_packets = tx.packets,
            tx_no_data = tx.no_data,
            rx_packets = rx.packets,
            rx_frames = rx.frames,
            rx_malformed = rx.malformed,
            rx_dimension_mismatches = rx.dimension_mismatches,
            rx_discontinuities = rx.discontinuities,
            verified = signal.verified,
            glitches = signal.glitches,
            midi_sent = self.midi.sent,
            midi_received = self.midi.received,
            bus_resets = self.manager.bus_resets(),
            "stream statistics"
        );
        self.rx.monitor().report();
    }
}

enum Event {
    Shutdown,
    Tick,
    Report,
    BusReset,
}

/// The runtime of monitor service.
pub struct SytMonitorRuntime {
    engine: MonitorEngine,
    params: MonitorParams,
    rx: mpsc::Receiver<Event>,
    tx: mpsc::SyncSender<Event>,
    dispatchers: Vec<Dispatcher>,
}

impl Drop for SytMonitorRuntime {
    fn drop(&mut self) {
        // At first, stop event loop in all of dispatchers to avoid queueing new events.
        for dispatcher in &mut self.dispatchers {
            dispatcher.stop();
        }

        // Next, consume all events in queue to release blocked thread for sender.
        for _ in self.rx.try_iter() {}

        // Finally Finish I/O threads.
        self.dispatchers.clear();
    }
}

impl RuntimeOperation<MonitorParams> for SytMonitorRuntime {
    fn new(params: MonitorParams, log_level: Option<LogLevel>) -> Result<Self, Error> {
        init_tracing(log_level);

        let engine = MonitorEngine::new(&params)?;

        // Use uni-directional channel for communication to child threads.
        let (tx, rx) = mpsc::sync_channel(32);

        Ok(Self {
            engine,
            params,
            rx,
            tx,
            dispatchers: Default::default(),
        })
    }

    fn listen(&mut self) -> Result<(), Error> {
        self.launch_system_event_dispatcher()?;
        self.launch_timer_dispatcher()?;
        Ok(())
    }

    fn run(&mut self) -> Result<(), Error> {
        let enter = debug_span!("event").entered();

        self.engine.start(true)?;

        let launched = Instant::now();
        let mut cycles = 0;

        loop {
            let ev = match self.rx.recv() {
                Ok(ev) => ev,
                Err(_) => continue,
            };

            match ev {
                Event::Shutdown => break,
                Event::Tick => {
                    let elapsed = launched.elapsed();
                    if let Some(duration) = self.params.duration {
                        if elapsed >= duration {
                            break;
                        }
                    }
                    let target = elapsed.as_micros() as u64 * CYCLES_PER_SECOND as u64 / 1000000;
                    if target > cycles {
                        self.engine.step(target - cycles)?;
                        cycles = target;
                    }
                }
                Event::Report => {
                    let _enter = debug_span!("report").entered();
                    self.engine.report();
                }
                Event::BusReset => self.engine.inject_bus_reset(),
            }
        }

        self.engine.stop()?;
        self.engine.report();

        enter.exit();

        Ok(())
    }
}

impl SytMonitorRuntime {
    const SYSTEM_DISPATCHER_NAME: &'static str = "system event dispatcher";
    const TIMER_DISPATCHER_NAME: &'static str = "interval timer dispatcher";

    const TICK_INTERVAL: Duration = Duration::from_millis(1);

    fn launch_system_event_dispatcher(&mut self) -> Result<(), Error> {
        let name = Self::SYSTEM_DISPATCHER_NAME.to_string();
        let mut dispatcher = Dispatcher::run(name)?;

        let tx = self.tx.clone();
        dispatcher.attach_signal_handler(signal::Signal::SIGINT, move || {
            let _ = tx.send(Event::Shutdown);
            glib::ControlFlow::Break
        });

        self.dispatchers.push(dispatcher);

        Ok(())
    }

    fn launch_timer_dispatcher(&mut self) -> Result<(), Error> {
        let name = Self::TIMER_DISPATCHER_NAME.to_string();
        let mut dispatcher = Dispatcher::run(name)?;

        // The tick is skipped when the queue is full, since the cycle follows elapsed time.
        let tx = self.tx.clone();
        dispatcher.attach_interval_handler(Self::TICK_INTERVAL, move || {
            let _ = tx.try_send(Event::Tick);
            glib::ControlFlow::Continue
        });

        let tx = self.tx.clone();
        dispatcher.attach_interval_handler(self.params.report_interval, move || {
            let _ = tx.send(Event::Report);
            glib::ControlFlow::Continue
        });

        if let Some(interval) = self.params.bus_reset_interval {
            let tx = self.tx.clone();
            dispatcher.attach_interval_handler(interval, move || {
                let _ = tx.send(Event::BusReset);
                glib::ControlFlow::Continue
            });
        }

        self.dispatchers.push(dispatcher);

        Ok(())
    }
}

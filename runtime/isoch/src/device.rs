// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Capabilities of device consumed by streaming engine.
//!
//! Each backend implements the small set of traits instead of inheriting from a generic device.
//! The streaming engine uses the clock source to switch sampling rate and mode of optical
//! interface, and the factory to instantiate stream processors with the layout of ports.

use {
    super::{packet_buffer::*, stream_processor::*},
    firewire_isoch_protocols::{layout::*, IsochProtocolError},
    glib::{Error, FileError},
    std::collections::HashMap,
    tracing::debug,
};

/// The operation to access registers of device in quadlet.
pub trait RegisterAccessor {
    fn read_quadlet(&mut self, offset: u32) -> Result<u32, Error>;

    fn write_quadlet(&mut self, offset: u32, quad: u32) -> Result<(), Error>;
}

/// The image of registers in memory, useful when the device is not attached to the bus.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RegisterImage {
    quads: HashMap<u32, u32>,
    writes: usize,
}

impl RegisterImage {
    /// Add the register with the initial value.
    pub fn with(mut self, offset: u32, quad: u32) -> Self {
        self.quads.insert(offset, quad);
        self
    }

    pub fn get(&self, offset: u32) -> Option<u32> {
        self.quads.get(&offset).copied()
    }

    /// The number of write operations.
    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl RegisterAccessor for RegisterImage {
    fn read_quadlet(&mut self, offset: u32) -> Result<u32, Error> {
        self.get(offset).ok_or_else(|| {
            let msg = format!("No register at 0x{:04x}", offset);
            Error::new(FileError::Noent, &msg)
        })
    }

    fn write_quadlet(&mut self, offset: u32, quad: u32) -> Result<(), Error> {
        match self.quads.get_mut(&offset) {
            Some(q) => {
                *q = quad;
                self.writes += 1;
                Ok(())
            }
            None => {
                let msg = format!("No register at 0x{:04x}", offset);
                Err(Error::new(FileError::Noent, &msg))
            }
        }
    }
}

/// The operation of clock source in device.
pub trait ClockSourceProvider {
    fn supported_rates(&self) -> &'static [u32];

    fn supported_optical_modes(&self) -> &'static [OpticalMode];

    fn read_rate(&mut self) -> Result<u32, Error>;

    fn write_rate(&mut self, rate: u32) -> Result<(), Error>;

    fn read_optical_mode(&mut self) -> Result<OpticalMode, Error>;

    fn write_optical_mode(&mut self, mode: OpticalMode) -> Result<(), Error>;
}

/// The factory of stream processors with the layout of ports for the device.
pub trait StreamProcessorFactory {
    fn capture_layout(&self) -> &'static LayoutSpec;

    fn playback_layout(&self) -> &'static LayoutSpec;

    fn create_receive_processor(
        &self,
        config: &StreamConfig,
        packets: PacketConsumer,
    ) -> Result<ReceiveStreamProcessor, Error> {
        ReceiveStreamProcessor::new(self.capture_layout(), config.rate, config.optical, packets)
    }

    fn create_transmit_processor(
        &self,
        config: &StreamConfig,
        sid: u8,
        packets: PacketProducer,
    ) -> Result<TransmitStreamProcessor, Error> {
        TransmitStreamProcessor::new(self.playback_layout(), config, sid, packets)
    }

    /// Create the processor to receive packets of the playback stream in the bus, for loopback.
    fn create_monitor_processor(
        &self,
        config: &StreamConfig,
        packets: PacketConsumer,
    ) -> Result<ReceiveStreamProcessor, Error> {
        ReceiveStreamProcessor::new(self.playback_layout(), config.rate, config.optical, packets)
    }
}

/// The device consumed by streaming engine.
pub trait StreamingDevice: ClockSourceProvider + StreamProcessorFactory + Send {
    fn name(&self) -> &str;
}

fn unsupported(label: &str) -> Error {
    Error::new(IsochProtocolError::UnsupportedConfiguration, label)
}

/// Change sampling rate and mode of optical interface for the device and stream processors.
/// Any failure of validation leaves all of them in the previous configuration. The stream
/// processor for transmission should not be running.
pub fn reconfigure<D: ClockSourceProvider + ?Sized>(
    device: &mut D,
    rx: &mut ReceiveStreamProcessor,
    tx: &mut TransmitStreamProcessor,
    rate: u32,
    optical: OpticalMode,
) -> Result<(), Error> {
    if !device.supported_rates().iter().any(|&r| r == rate) {
        let msg = format!("Sampling rate {} is not supported by the device", rate);
        Err(unsupported(&msg))?;
    }
    if !device.supported_optical_modes().iter().any(|&m| m == optical) {
        let msg = format!("Optical mode {:?} is not supported by the device", optical);
        Err(unsupported(&msg))?;
    }
    rx.validate(rate, optical)?;
    tx.validate(rate, optical)?;

    let prev_rate = device.read_rate()?;
    let prev_optical = device.read_optical_mode()?;

    device.write_rate(rate)?;
    if let Err(e) = device.write_optical_mode(optical) {
        let _ = device.write_rate(prev_rate);
        Err(e)?;
    }

    // The validation above guarantees success.
    if let Err(e) = rx
        .configure(rate, optical)
        .and_then(|_| tx.configure(rate, optical))
    {
        let _ = device.write_rate(prev_rate);
        let _ = device.write_optical_mode(prev_optical);
        let _ = rx.configure(prev_rate, prev_optical);
        Err(e)?;
    }

    debug!(rate, ?optical, "reconfigured");

    Ok(())
}

fn serialize_flag<T: Copy + Eq>(
    flag: &T,
    quad: &mut u32,
    mask: u32,
    shift: usize,
    flags: &[T],
    vals: &[u8],
    label: &str,
) -> Result<(), Error> {
    flags
        .iter()
        .zip(vals)
        .find(|(f, _)| flag.eq(f))
        .ok_or_else(|| {
            let label = format!(
                "Invalid argument for {}, 0x{:08x}, 0x{:08x}",
                label, *quad, mask
            );
            unsupported(&label)
        })
        .map(|(_, &val)| {
            *quad &= !mask;
            *quad |= (val as u32) << shift;
        })
}

fn deserialize_flag<T: Copy + Eq>(
    flag: &mut T,
    quad: &u32,
    mask: u32,
    shift: usize,
    flags: &[T],
    vals: &[u8],
    label: &str,
) -> Result<(), Error> {
    let val = ((*quad & mask) >> shift) as u8;
    flags
        .iter()
        .zip(vals)
        .find(|(_, v)| val.eq(v))
        .ok_or_else(|| {
            let label = format!(
                "Invalid value for {}, 0x{:08x}, 0x{:08x}",
                label, quad, mask
            );
            Error::new(FileError::Io, &label)
        })
        .map(|(&f, _)| *flag = f)
}

const MOTU_V2_OFFSET_CLK: u32 = 0x0b14;
const MOTU_V2_OFFSET_PORT: u32 = 0x0c04;

const MOTU_V2_CLK_RATE_LABEL: &str = "clock-rate-v2";
const MOTU_V2_CLK_RATE_MASK: u32 = 0x00000038;
const MOTU_V2_CLK_RATE_SHIFT: usize = 3;

const MOTU_V2_OPT_IN_IFACE_LABEL: &str = "optical-input-iface-v2";
const MOTU_V2_OPT_IN_IFACE_MASK: u32 = 0x00000300;
const MOTU_V2_OPT_IN_IFACE_SHIFT: usize = 8;

const MOTU_V2_OPT_OUT_IFACE_LABEL: &str = "optical-output-iface-v2";
const MOTU_V2_OPT_OUT_IFACE_MASK: u32 = 0x00000c00;
const MOTU_V2_OPT_OUT_IFACE_SHIFT: usize = 10;

const MOTU_V2_CLK_RATES: &[u32] = &[44100, 48000, 88200, 96000, 176400, 192000];
const MOTU_V2_CLK_RATE_VALS: &[u8] = &[0x00, 0x01, 0x02, 0x03, 0x04, 0x05];

const MOTU_V2_OPT_IFACE_MODES: &[OpticalMode] =
    &[OpticalMode::Off, OpticalMode::Adat, OpticalMode::Toslink];
const MOTU_V2_OPT_IFACE_MODE_VALS: &[u8] = &[0x00, 0x01, 0x02];

/// The backend for MOTU version 2 models. The sampling rate and the mode of optical interfaces
/// are configured by registers.
#[derive(Debug)]
pub struct MotuV2Device<R: RegisterAccessor> {
    regs: R,
}

impl<R: RegisterAccessor> MotuV2Device<R> {
    pub fn new(regs: R) -> Self {
        Self { regs }
    }

    pub fn regs(&self) -> &R {
        &self.regs
    }
}

impl MotuV2Device<RegisterImage> {
    /// The image of registers after power-on: 48.0 kHz without optical interface.
    pub fn default_image() -> RegisterImage {
        RegisterImage::default()
            .with(MOTU_V2_OFFSET_CLK, 0x01 << MOTU_V2_CLK_RATE_SHIFT)
            .with(MOTU_V2_OFFSET_PORT, 0)
    }
}

impl<R: RegisterAccessor> ClockSourceProvider for MotuV2Device<R> {
    fn supported_rates(&self) -> &'static [u32] {
        MOTU_V2_CLK_RATES
    }

    fn supported_optical_modes(&self) -> &'static [OpticalMode] {
        MOTU_V2_OPT_IFACE_MODES
    }

    fn read_rate(&mut self) -> Result<u32, Error> {
        let quad = self.regs.read_quadlet(MOTU_V2_OFFSET_CLK)?;
        let mut rate = 0;
        deserialize_flag(
            &mut rate,
            &quad,
            MOTU_V2_CLK_RATE_MASK,
            MOTU_V2_CLK_RATE_SHIFT,
            MOTU_V2_CLK_RATES,
            MOTU_V2_CLK_RATE_VALS,
            MOTU_V2_CLK_RATE_LABEL,
        )?;
        Ok(rate)
    }

    fn write_rate(&mut self, rate: u32) -> Result<(), Error> {
        let mut quad = self.regs.read_quadlet(MOTU_V2_OFFSET_CLK)?;
        serialize_flag(
            &rate,
            &mut quad,
            MOTU_V2_CLK_RATE_MASK,
            MOTU_V2_CLK_RATE_SHIFT,
            MOTU_V2_CLK_RATES,
            MOTU_V2_CLK_RATE_VALS,
            MOTU_V2_CLK_RATE_LABEL,
        )?;
        self.regs.write_quadlet(MOTU_V2_OFFSET_CLK, quad)
    }

    fn read_optical_mode(&mut self) -> Result<OpticalMode, Error> {
        let quad = self.regs.read_quadlet(MOTU_V2_OFFSET_PORT)?;
        let mut mode = OpticalMode::default();
        deserialize_flag(
            &mut mode,
            &quad,
            MOTU_V2_OPT_IN_IFACE_MASK,
            MOTU_V2_OPT_IN_IFACE_SHIFT,
            MOTU_V2_OPT_IFACE_MODES,
            MOTU_V2_OPT_IFACE_MODE_VALS,
            MOTU_V2_OPT_IN_IFACE_LABEL,
        )?;
        Ok(mode)
    }

    /// Both of input and output interfaces are configured.
    fn write_optical_mode(&mut self, mode: OpticalMode) -> Result<(), Error> {
        let mut quad = self.regs.read_quadlet(MOTU_V2_OFFSET_PORT)?;
        serialize_flag(
            &mode,
            &mut quad,
            MOTU_V2_OPT_IN_IFACE_MASK,
            MOTU_V2_OPT_IN_IFACE_SHIFT,
            MOTU_V2_OPT_IFACE_MODES,
            MOTU_V2_OPT_IFACE_MODE_VALS,
            MOTU_V2_OPT_IN_IFACE_LABEL,
        )?;
        serialize_flag(
            &mode,
            &mut quad,
            MOTU_V2_OPT_OUT_IFACE_MASK,
            MOTU_V2_OPT_OUT_IFACE_SHIFT,
            MOTU_V2_OPT_IFACE_MODES,
            MOTU_V2_OPT_IFACE_MODE_VALS,
            MOTU_V2_OPT_OUT_IFACE_LABEL,
        )?;
        self.regs.write_quadlet(MOTU_V2_OFFSET_PORT, quad)
    }
}

impl<R: RegisterAccessor> StreamProcessorFactory for MotuV2Device<R> {
    fn capture_layout(&self) -> &'static LayoutSpec {
        &MOTU_V2_CAPTURE_LAYOUT
    }

    fn playback_layout(&self) -> &'static LayoutSpec {
        &MOTU_V2_PLAYBACK_LAYOUT
    }
}

impl<R: RegisterAccessor + Send> StreamingDevice for MotuV2Device<R> {
    fn name(&self) -> &str {
        "motu-v2"
    }
}

const BEBOB_CLK_RATES: &[u32] = &[32000, 44100, 48000, 88200, 96000];
const BEBOB_OPT_IFACE_MODES: &[OpticalMode] = &[OpticalMode::Off, OpticalMode::Toslink];

/// The backend for BeBoB models with AM824 data channels. The sampling rate is configured by
/// AV/C command, thus the backend caches the state of clock.
#[derive(Debug)]
pub struct BebobDevice {
    rate: u32,
    optical: OpticalMode,
}

impl Default for BebobDevice {
    fn default() -> Self {
        Self {
            rate: 48000,
            optical: OpticalMode::Off,
        }
    }
}

impl ClockSourceProvider for BebobDevice {
    fn supported_rates(&self) -> &'static [u32] {
        BEBOB_CLK_RATES
    }

    fn supported_optical_modes(&self) -> &'static [OpticalMode] {
        BEBOB_OPT_IFACE_MODES
    }

    fn read_rate(&mut self) -> Result<u32, Error> {
        Ok(self.rate)
    }

    fn write_rate(&mut self, rate: u32) -> Result<(), Error> {
        if !BEBOB_CLK_RATES.iter().any(|&r| r == rate) {
            let msg = format!("Invalid argument for sampling rate: {}", rate);
            Err(unsupported(&msg))?;
        }
        self.rate = rate;
        Ok(())
    }

    fn read_optical_mode(&mut self) -> Result<OpticalMode, Error> {
        Ok(self.optical)
    }

    fn write_optical_mode(&mut self, mode: OpticalMode) -> Result<(), Error> {
        if !BEBOB_OPT_IFACE_MODES.iter().any(|&m| m == mode) {
            let msg = format!("Invalid argument for optical interface: {:?}", mode);
            Err(unsupported(&msg))?;
        }
        self.optical = mode;
        Ok(())
    }
}

impl StreamProcessorFactory for BebobDevice {
    fn capture_layout(&self) -> &'static LayoutSpec {
        &BEBOB_CAPTURE_LAYOUT
    }

    fn playback_layout(&self) -> &'static LayoutSpec {
        &BEBOB_PLAYBACK_LAYOUT
    }
}

impl StreamingDevice for BebobDevice {
    fn name(&self) -> &str {
        "bebob"
    }
}

#[cfg(test)]
mod test {
    use {
        super::*, crate::iso_stream::ISO_HEADER_SIZE,
        firewire_isoch_protocols::IsochStreamError,
    };

    fn processors<D: StreamProcessorFactory>(
        device: &D,
        config: &StreamConfig,
    ) -> (ReceiveStreamProcessor, TransmitStreamProcessor) {
        let size = max_packet_size(device.capture_layout());
        let (_, consumer) = PacketBuffer::new(ISO_HEADER_SIZE, 4, size).unwrap();
        let rx = device.create_receive_processor(config, consumer).unwrap();

        let size = max_packet_size(device.playback_layout());
        let (producer, _) = PacketBuffer::new(ISO_HEADER_SIZE, 4, size).unwrap();
        let tx = device.create_transmit_processor(config, 0, producer).unwrap();

        (rx, tx)
    }

    #[test]
    fn motu_v2_registers() {
        let image = MotuV2Device::default_image()
            .with(MOTU_V2_OFFSET_CLK, 0x0000_8001 | (0x01 << MOTU_V2_CLK_RATE_SHIFT))
            .with(MOTU_V2_OFFSET_PORT, 0x0000_1000);
        let mut device = MotuV2Device::new(image);

        assert_eq!(device.read_rate().unwrap(), 48000);
        assert_eq!(device.read_optical_mode().unwrap(), OpticalMode::Off);

        device.write_rate(96000).unwrap();
        assert_eq!(device.regs().get(MOTU_V2_OFFSET_CLK), Some(0x0000_8019));
        assert_eq!(device.read_rate().unwrap(), 96000);

        device.write_optical_mode(OpticalMode::Adat).unwrap();
        assert_eq!(device.regs().get(MOTU_V2_OFFSET_PORT), Some(0x0000_1500));
        device.write_optical_mode(OpticalMode::Toslink).unwrap();
        assert_eq!(device.regs().get(MOTU_V2_OFFSET_PORT), Some(0x0000_1a00));
        assert_eq!(device.read_optical_mode().unwrap(), OpticalMode::Toslink);

        let writes = device.regs().writes();
        assert!(device.write_rate(32000).is_err());
        assert_eq!(device.regs().writes(), writes);
    }

    #[test]
    fn motu_v2_invalid_register_value() {
        let image = RegisterImage::default()
            .with(MOTU_V2_OFFSET_CLK, 0x07 << MOTU_V2_CLK_RATE_SHIFT)
            .with(MOTU_V2_OFFSET_PORT, 0x03 << MOTU_V2_OPT_IN_IFACE_SHIFT);
        let mut device = MotuV2Device::new(image);

        let err = device.read_rate().unwrap_err();
        assert_eq!(err.kind::<FileError>(), Some(FileError::Io));
        assert!(device.read_optical_mode().is_err());

        let mut device = MotuV2Device::new(RegisterImage::default());
        let err = device.read_rate().unwrap_err();
        assert_eq!(err.kind::<FileError>(), Some(FileError::Noent));
    }

    #[test]
    fn reconfigure_motu_v2() {
        let mut device = MotuV2Device::new(MotuV2Device::default_image());
        let config = StreamConfig::default();
        let (mut rx, mut tx) = processors(&device, &config);

        reconfigure(&mut device, &mut rx, &mut tx, 88200, OpticalMode::Adat).unwrap();
        assert_eq!(device.read_rate().unwrap(), 88200);
        assert_eq!(device.read_optical_mode().unwrap(), OpticalMode::Adat);
        assert_eq!(rx.rate(), 88200);
        assert_eq!(tx.layout().optical(), OpticalMode::Adat);
        assert_eq!(tx.layout().tier(), RateTier::Double);

        // ADAT is not available at 4x rate.
        let writes = device.regs().writes();
        let err = reconfigure(&mut device, &mut rx, &mut tx, 176400, OpticalMode::Adat)
            .unwrap_err();
        assert_eq!(
            err.kind::<IsochProtocolError>(),
            Some(IsochProtocolError::UnsupportedConfiguration)
        );
        assert_eq!(device.regs().writes(), writes);
        assert_eq!(device.read_rate().unwrap(), 88200);
        assert_eq!(rx.rate(), 88200);
        assert_eq!(tx.rate(), 88200);

        reconfigure(&mut device, &mut rx, &mut tx, 176400, OpticalMode::Off).unwrap();
        assert_eq!(rx.layout().dbs(), 10);
    }

    #[test]
    fn reconfigure_while_running() {
        let mut device = BebobDevice::default();
        let config = StreamConfig::default();
        let (mut rx, mut tx) = processors(&device, &config);

        tx.start(0);
        let err = reconfigure(&mut device, &mut rx, &mut tx, 44100, OpticalMode::Off)
            .unwrap_err();
        assert_eq!(
            err.kind::<IsochStreamError>(),
            Some(IsochStreamError::InvalidState)
        );
        assert_eq!(device.read_rate().unwrap(), 48000);

        tx.stop();
        reconfigure(&mut device, &mut rx, &mut tx, 44100, OpticalMode::Toslink).unwrap();
        assert_eq!(device.read_rate().unwrap(), 44100);
        assert_eq!(rx.layout().dbs(), 5);
        assert_eq!(tx.layout().dbs(), 11);

        // Not supported by the device.
        assert!(reconfigure(&mut device, &mut rx, &mut tx, 44100, OpticalMode::Adat).is_err());
        assert!(reconfigure(&mut device, &mut rx, &mut tx, 192000, OpticalMode::Off).is_err());
        assert_eq!(device.read_optical_mode().unwrap(), OpticalMode::Toslink);
    }
}

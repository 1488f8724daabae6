// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

use {
    clap::Parser,
    firewire_isoch_runtime::{
        stream_processor::StreamConfig, DeviceModel, MonitorParams, OpticalIface,
        SytMonitorRuntime,
    },
    runtime_core::{cmdline::*, LogLevel},
    std::time::Duration,
};

struct SytMonitorServiceCmd;

#[derive(Parser, Default)]
#[clap(name = "firewire-isoch-sytmonitor")]
struct Arguments {
    /// The model of device to emulate in the loopback bus.
    #[clap(long, short, value_enum, default_value_t = DeviceModel::MotuV2)]
    model: DeviceModel,

    /// The sampling rate.
    #[clap(long, short, default_value_t = 48000)]
    rate: u32,

    /// The mode of optical interface.
    #[clap(long, short, value_enum, default_value_t = OpticalIface::Off)]
    optical: OpticalIface,

    /// The number of packets processed per interrupt of isochronous context.
    #[clap(long, default_value_t = 16)]
    irq_interval: usize,

    /// The number of packets in the packet buffer.
    #[clap(long, default_value_t = 256)]
    buffer_packets: usize,

    /// Stop after the seconds, or run until SIGINT.
    #[clap(long, short)]
    duration: Option<u64>,

    /// Generate bus reset periodically at the interval in seconds.
    #[clap(long)]
    bus_reset_interval: Option<u64>,

    /// The level to debug runtime, disabled as a default.
    #[clap(long, short, value_enum)]
    log_level: Option<LogLevel>,
}

impl ServiceCmd<Arguments, MonitorParams, SytMonitorRuntime> for SytMonitorServiceCmd {
    fn params(args: &Arguments) -> (MonitorParams, Option<LogLevel>) {
        let config = StreamConfig {
            rate: args.rate,
            optical: args.optical.into(),
            irq_interval: args.irq_interval,
            buffer_packets: args.buffer_packets,
            ..Default::default()
        };
        let params = MonitorParams {
            model: args.model,
            config,
            duration: args.duration.map(Duration::from_secs),
            bus_reset_interval: args.bus_reset_interval.map(Duration::from_secs),
            ..Default::default()
        };
        (params, args.log_level)
    }
}

fn main() {
    SytMonitorServiceCmd::run()
}

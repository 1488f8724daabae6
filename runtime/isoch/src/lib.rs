// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Runtime of isochronous packet streaming for audio and music units in IEEE 1394 bus.
//!
//! The packet buffer is the only data shared between the thread for isochronous context and
//! the thread of application. Stream processors run in the latter.

pub mod device;
pub mod iso_handler;
pub mod iso_stream;
pub mod loopback;
pub mod packet_buffer;
pub mod port;
pub mod runtime;
pub mod stream_processor;
pub mod syt_monitor;

pub use runtime::{DeviceModel, MonitorEngine, MonitorParams, OpticalIface, SytMonitorRuntime};

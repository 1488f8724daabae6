// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Protocol about AM824 data format.
//!
//! The module includes helper functions for the quadlet of AM824 data format, defined in
//! IEC 61883-6. The first byte is label to express the type of data in the following 24 bits.
//! Additionally the module includes helper functions for raw 24 bit sample without label, which
//! some vendors use in their own data block.

/// The label of Multi-bit Linear Audio (MBLA) with 24 bit sample.
pub const LABEL_MBLA: u8 = 0x40;

/// The label of MIDI conformant data channel without data.
pub const LABEL_MIDI_NO_DATA: u8 = 0x80;

/// The label of MIDI conformant data channel with 1 byte.
pub const LABEL_MIDI_1: u8 = 0x81;

/// The label of MIDI conformant data channel with 2 bytes.
pub const LABEL_MIDI_2: u8 = 0x82;

/// The label of MIDI conformant data channel with 3 bytes.
pub const LABEL_MIDI_3: u8 = 0x83;

/// The number of multiplexed MIDI ports in one MIDI conformant data channel.
pub const MIDI_MPX_COUNT: usize = 8;

/// The size of AM824 quadlet.
pub const AM824_SIZE: usize = 4;

/// The size of raw 24 bit sample.
pub const RAW24_SIZE: usize = 3;

const SAMPLE_MAX: i32 = 0x007fffff;
const SAMPLE_MIN: i32 = -0x00800000;

fn clamp_sample(sample: i32) -> i32 {
    sample.clamp(SAMPLE_MIN, SAMPLE_MAX)
}

fn sign_extend(raw: u32) -> i32 {
    ((raw << 8) as i32) >> 8
}

/// Build the quadlet of MBLA for the 24 bit signed sample.
pub fn serialize_audio(sample: i32, raw: &mut [u8]) {
    assert!(raw.len() >= AM824_SIZE);
    let sample = clamp_sample(sample) as u32;
    raw[0] = LABEL_MBLA;
    raw[1..4].copy_from_slice(&sample.to_be_bytes()[1..]);
}

/// Parse the quadlet of MBLA to 24 bit signed sample.
pub fn deserialize_audio(raw: &[u8]) -> i32 {
    assert!(raw.len() >= AM824_SIZE);
    let val = u32::from_be_bytes([0, raw[1], raw[2], raw[3]]);
    sign_extend(val)
}

/// Build raw 24 bit sample without label.
pub fn serialize_raw24(sample: i32, raw: &mut [u8]) {
    assert!(raw.len() >= RAW24_SIZE);
    let sample = clamp_sample(sample) as u32;
    raw[..3].copy_from_slice(&sample.to_be_bytes()[1..]);
}

/// Parse raw 24 bit sample without label.
pub fn deserialize_raw24(raw: &[u8]) -> i32 {
    assert!(raw.len() >= RAW24_SIZE);
    let val = u32::from_be_bytes([0, raw[0], raw[1], raw[2]]);
    sign_extend(val)
}

/// Build the quadlet of MIDI conformant data channel. Bytes more than 3 are ignored.
pub fn serialize_midi(bytes: &[u8], raw: &mut [u8]) {
    assert!(raw.len() >= AM824_SIZE);
    let count = bytes.len().min(3);
    raw[..AM824_SIZE].fill(0);
    raw[0] = LABEL_MIDI_NO_DATA + count as u8;
    raw[1..(1 + count)].copy_from_slice(&bytes[..count]);
}

/// Parse the quadlet of MIDI conformant data channel. The quadlet with any other label
/// results in empty bytes.
pub fn deserialize_midi(raw: &[u8]) -> &[u8] {
    if raw.len() < AM824_SIZE {
        return &[];
    }

    match raw[0] {
        LABEL_MIDI_1 => &raw[1..2],
        LABEL_MIDI_2 => &raw[1..3],
        LABEL_MIDI_3 => &raw[1..4],
        _ => &[],
    }
}

/// The index of multiplexed MIDI port for the data block.
pub fn midi_mpx_index(dbc: u8, data_block: usize) -> usize {
    (dbc as usize + data_block) % MIDI_MPX_COUNT
}

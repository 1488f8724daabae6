// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Protocol about Common Isochronous Packet (CIP) header.
//!
//! The module includes structure, enumeration, and trait and its implementation for the two
//! quadlet header of CIP with SYT field, defined in IEC 61883-1.
//!
//! ```text
//! q0: | EOH0(2)=00 | SID(6) | DBS(8) | FN(2) | QPC(3) | SPH(1) | rsv(2) | DBC(8) |
//! q1: | EOH1(2)=10 | FMT(6) | FDF(8) |                  SYT(16)                   |
//! ```

use super::{cycle_time::SYT_NO_INFO, IsochProtocolError};

/// The size of CIP header in bytes.
pub const CIP_HEADER_SIZE: usize = 8;

/// The value of FMT field for AM824 data format.
pub const FMT_AM824: u8 = 0x10;

/// The value of FDF field for AM824 data format to express packet without data.
pub const FDF_NO_DATA: u8 = 0xff;

const EOH0_MASK: u32 = 0xc0000000;
const EOH0_SHIFT: usize = 30;
const SID_MASK: u32 = 0x3f000000;
const SID_SHIFT: usize = 24;
const DBS_MASK: u32 = 0x00ff0000;
const DBS_SHIFT: usize = 16;
const FN_MASK: u32 = 0x0000c000;
const FN_SHIFT: usize = 14;
const QPC_MASK: u32 = 0x00003800;
const QPC_SHIFT: usize = 11;
const SPH_FLAG: u32 = 0x00000400;
const DBC_MASK: u32 = 0x000000ff;

const EOH1_MASK: u32 = 0xc0000000;
const EOH1_SHIFT: usize = 30;
const FMT_MASK: u32 = 0x3f000000;
const FMT_SHIFT: usize = 24;
const FDF_MASK: u32 = 0x00ff0000;
const FDF_SHIFT: usize = 16;
const SYT_MASK: u32 = 0x0000ffff;

const EOH0_VALUE: u32 = 0b00;
const EOH1_VALUE: u32 = 0b10;

const SFC_MASK: u8 = 0x07;

/// The nominal sampling transfer frequency and its code in FDF field.
const SFC_TABLE: [(u32, u8); 7] = [
    (32000, 0x00),
    (44100, 0x01),
    (48000, 0x02),
    (88200, 0x03),
    (96000, 0x04),
    (176400, 0x05),
    (192000, 0x06),
];

/// The code of sampling frequency for the rate.
pub fn sfc_from_rate(rate: u32) -> Option<u8> {
    SFC_TABLE
        .iter()
        .find(|(r, _)| *r == rate)
        .map(|(_, sfc)| *sfc)
}

/// The sampling rate for the code of sampling frequency.
pub fn rate_from_sfc(sfc: u8) -> Option<u32> {
    SFC_TABLE
        .iter()
        .find(|(_, s)| *s == sfc & SFC_MASK)
        .map(|(rate, _)| *rate)
}

/// The content of CIP header.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct CipHeader {
    /// Source node ID.
    pub sid: u8,
    /// Data block size in quadlets.
    pub dbs: u8,
    /// Fraction number.
    pub fraction_number: u8,
    /// Quadlet padding count.
    pub qpc: u8,
    /// Source packet header.
    pub sph: bool,
    /// Data block counter, the sequence number of the first data block in the packet.
    pub dbc: u8,
    /// Format of data.
    pub fmt: u8,
    /// Format dependent field.
    pub fdf: u8,
    /// Presentation time of the first event.
    pub syt: u16,
}

impl CipHeader {
    /// The header of AM824 packet with data blocks.
    pub fn am824(sid: u8, dbs: u8, dbc: u8, sfc: u8, syt: u16) -> Self {
        Self {
            sid,
            dbs,
            dbc,
            fmt: FMT_AM824,
            fdf: sfc & SFC_MASK,
            syt,
            ..Default::default()
        }
    }

    /// The header of AM824 packet without data block.
    pub fn no_data(sid: u8, dbs: u8, dbc: u8) -> Self {
        Self {
            sid,
            dbs,
            dbc,
            fmt: FMT_AM824,
            fdf: FDF_NO_DATA,
            syt: SYT_NO_INFO,
            ..Default::default()
        }
    }

    pub fn parse(raw: &[u8]) -> Result<Self, IsochProtocolError> {
        if raw.len() < CIP_HEADER_SIZE {
            Err(IsochProtocolError::ShortPacket)?;
        }

        let mut quadlet = [0; 4];
        quadlet.copy_from_slice(&raw[..4]);
        let q0 = u32::from_be_bytes(quadlet);
        quadlet.copy_from_slice(&raw[4..8]);
        let q1 = u32::from_be_bytes(quadlet);

        if (q0 & EOH0_MASK) >> EOH0_SHIFT != EOH0_VALUE
            || (q1 & EOH1_MASK) >> EOH1_SHIFT != EOH1_VALUE
        {
            Err(IsochProtocolError::MalformedHeader)?;
        }

        Ok(Self {
            sid: ((q0 & SID_MASK) >> SID_SHIFT) as u8,
            dbs: ((q0 & DBS_MASK) >> DBS_SHIFT) as u8,
            fraction_number: ((q0 & FN_MASK) >> FN_SHIFT) as u8,
            qpc: ((q0 & QPC_MASK) >> QPC_SHIFT) as u8,
            sph: q0 & SPH_FLAG > 0,
            dbc: (q0 & DBC_MASK) as u8,
            fmt: ((q1 & FMT_MASK) >> FMT_SHIFT) as u8,
            fdf: ((q1 & FDF_MASK) >> FDF_SHIFT) as u8,
            syt: (q1 & SYT_MASK) as u16,
        })
    }

    pub fn build(&self, raw: &mut [u8]) -> Result<(), IsochProtocolError> {
        if raw.len() < CIP_HEADER_SIZE {
            Err(IsochProtocolError::ShortPacket)?;
        }

        let mut q0 = EOH0_VALUE << EOH0_SHIFT;
        q0 |= ((self.sid as u32) << SID_SHIFT) & SID_MASK;
        q0 |= ((self.dbs as u32) << DBS_SHIFT) & DBS_MASK;
        q0 |= ((self.fraction_number as u32) << FN_SHIFT) & FN_MASK;
        q0 |= ((self.qpc as u32) << QPC_SHIFT) & QPC_MASK;
        if self.sph {
            q0 |= SPH_FLAG;
        }
        q0 |= self.dbc as u32;

        let mut q1 = EOH1_VALUE << EOH1_SHIFT;
        q1 |= ((self.fmt as u32) << FMT_SHIFT) & FMT_MASK;
        q1 |= ((self.fdf as u32) << FDF_SHIFT) & FDF_MASK;
        q1 |= self.syt as u32;

        raw[..4].copy_from_slice(&q0.to_be_bytes());
        raw[4..8].copy_from_slice(&q1.to_be_bytes());

        Ok(())
    }

    /// Whether the packet carries no data block.
    pub fn is_no_data(&self) -> bool {
        self.fmt == FMT_AM824 && self.fdf == FDF_NO_DATA
    }

    /// The code of sampling frequency in FDF field of AM824 format.
    pub fn sfc(&self) -> u8 {
        self.fdf & SFC_MASK
    }

    /// The size of data block in bytes.
    pub fn data_block_size(&self) -> usize {
        self.dbs as usize * 4
    }

    /// The number of data blocks in the payload following the header.
    pub fn data_block_count(&self, payload_len: usize) -> Result<usize, IsochProtocolError> {
        let size = self.data_block_size();
        if size == 0 {
            if payload_len > 0 {
                Err(IsochProtocolError::MalformedHeader)
            } else {
                Ok(0)
            }
        } else if payload_len % size > 0 {
            Err(IsochProtocolError::ShortPacket)
        } else {
            Ok(payload_len / size)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cip_header_parse() {
        let raw = [0x02, 0x0b, 0x04, 0x10, 0x90, 0x02, 0x3a, 0xbc];
        let header = CipHeader::parse(&raw).unwrap();
        assert_eq!(header.sid, 0x02);
        assert_eq!(header.dbs, 0x0b);
        assert_eq!(header.fraction_number, 0);
        assert_eq!(header.qpc, 0);
        assert_eq!(header.sph, true);
        assert_eq!(header.dbc, 0x10);
        assert_eq!(header.fmt, FMT_AM824);
        assert_eq!(header.fdf, 0x02);
        assert_eq!(header.sfc(), 0x02);
        assert_eq!(header.syt, 0x3abc);
        assert!(!header.is_no_data());

        let mut built = [0; 8];
        header.build(&mut built).unwrap();
        assert_eq!(built, raw);
    }

    #[test]
    fn cip_header_no_data() {
        let header = CipHeader::no_data(0x3f, 8, 0xf8);
        let mut raw = [0; 8];
        header.build(&mut raw).unwrap();
        assert_eq!(raw, [0x3f, 0x08, 0x00, 0xf8, 0x90, 0xff, 0xff, 0xff]);
        assert!(CipHeader::parse(&raw).unwrap().is_no_data());
    }

    #[test]
    fn cip_header_malformed() {
        assert_eq!(
            CipHeader::parse(&[0x00, 0x02, 0x00, 0x00]),
            Err(IsochProtocolError::ShortPacket)
        );
        assert_eq!(
            CipHeader::parse(&[0x80, 0x02, 0x00, 0x00, 0x90, 0x02, 0xff, 0xff]),
            Err(IsochProtocolError::MalformedHeader)
        );
        assert_eq!(
            CipHeader::parse(&[0x00, 0x02, 0x00, 0x00, 0x10, 0x02, 0xff, 0xff]),
            Err(IsochProtocolError::MalformedHeader)
        );
    }

    #[test]
    fn data_block_count() {
        let header = CipHeader::am824(0, 3, 0, 2, 0);
        assert_eq!(header.data_block_count(0), Ok(0));
        assert_eq!(header.data_block_count(96), Ok(8));
        assert_eq!(
            header.data_block_count(95),
            Err(IsochProtocolError::ShortPacket)
        );

        let header = CipHeader::am824(0, 0, 0, 2, 0);
        assert_eq!(
            header.data_block_count(4),
            Err(IsochProtocolError::MalformedHeader)
        );
    }

    #[test]
    fn sampling_frequency_code() {
        assert_eq!(sfc_from_rate(44100), Some(1));
        assert_eq!(sfc_from_rate(192000), Some(6));
        assert_eq!(sfc_from_rate(22050), None);
        assert_eq!(rate_from_sfc(4), Some(96000));
        assert_eq!(rate_from_sfc(7), None);
    }
}

// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

use firewire_isoch_protocols::{am824::*, cip::*, cycle_time::*};

fn parse_quadlets(args: &[String]) -> Result<Vec<u8>, String> {
    let mut raw = Vec::new();
    args.iter().try_for_each(|arg| {
        let literal = arg.trim_start_matches("0x");
        u32::from_str_radix(literal, 16)
            .map(|quad| raw.extend_from_slice(&quad.to_be_bytes()))
            .map_err(|e| format!("Invalid quadlet '{}': {}", arg, e))
    })?;
    Ok(raw)
}

fn print_data_block(index: usize, block: &[u8]) {
    print!("  data block {:3}:", index);
    block.chunks_exact(4).for_each(|quad| {
        let desc = match quad[0] {
            LABEL_MBLA => format!(" MBLA({})", deserialize_audio(quad)),
            LABEL_MIDI_NO_DATA => " MIDI(-)".to_string(),
            LABEL_MIDI_1 | LABEL_MIDI_2 | LABEL_MIDI_3 => {
                let bytes: Vec<String> = deserialize_midi(quad)
                    .iter()
                    .map(|b| format!("{:02x}", b))
                    .collect();
                format!(" MIDI({})", bytes.join(" "))
            }
            _ => format!(
                " {:02x}{:02x}{:02x}{:02x}",
                quad[0], quad[1], quad[2], quad[3]
            ),
        };
        print!("{}", desc);
    });
    println!();
}

fn main() {
    let result: Result<(), String> = (|| {
        let args: Vec<String> = std::env::args().skip(1).collect();
        if args.len() < 2 {
            Err("At least two quadlets are required for CIP header".to_string())?;
        }

        let raw = parse_quadlets(&args)?;
        let header = CipHeader::parse(&raw).map_err(|e| e.to_string())?;

        println!("CIP header:");
        println!("  sid:  0x{:02x}", header.sid);
        println!("  dbs:  {}", header.dbs);
        println!("  fn:   {}", header.fraction_number);
        println!("  qpc:  {}", header.qpc);
        println!("  sph:  {}", header.sph);
        println!("  dbc:  {}", header.dbc);
        println!("  fmt:  0x{:02x}", header.fmt);
        println!("  fdf:  0x{:02x}", header.fdf);
        if header.syt == SYT_NO_INFO {
            println!("  syt:  no info");
        } else {
            println!(
                "  syt:  0x{:04x} (cycle nibble {}, offset {})",
                header.syt,
                syt_cycle_nibble(header.syt),
                syt_offset(header.syt)
            );
        }

        if header.is_no_data() {
            println!("No data block.");
            return Ok(());
        }

        if let Some(rate) = rate_from_sfc(header.sfc()) {
            println!("  rate: {}", rate);
        }

        let payload = &raw[CIP_HEADER_SIZE..];
        let count = header
            .data_block_count(payload.len())
            .map_err(|e| e.to_string())?;
        if count == 0 {
            println!("No data block.");
            return Ok(());
        }

        payload
            .chunks_exact(header.data_block_size())
            .take(count)
            .enumerate()
            .for_each(|(i, block)| print_data_block(i, block));

        Ok(())
    })();

    let code = match result {
        Ok(_) => 0,
        Err(msg) => {
            println!("{}", msg);
            print_help();
            1
        }
    };

    std::process::exit(code)
}

fn print_help() {
    print!(
        r###"
Usage:
  isoch-packet-parser QUADLET QUADLET [QUADLET ...]

  where:
    QUADLET:    The quadlet of isochronous packet in hexadecimal, in order of transmission,
                starting with the two quadlets of CIP header.
"###
    );
}

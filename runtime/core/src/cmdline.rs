// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2022 Takashi Sakamoto

use {
    super::{LogLevel, RuntimeOperation},
    clap::Parser,
    firewire_isoch_protocols::{IsochProtocolError, IsochStreamError},
    glib::{Error, FileError},
};

pub trait ServiceCmd<A, T, R>: Sized
where
    A: Parser,
    R: RuntimeOperation<T>,
{
    fn params(args: &A) -> (T, Option<LogLevel>);

    fn run() {
        let code = A::try_parse()
            .map_err(|err| err.to_string())
            .map(|args| Self::params(&args))
            .and_then(|(params, log_level)| {
                R::new(params, log_level)
                    .and_then(|mut runtime| {
                        runtime.listen()?;
                        runtime.run()?;
                        Ok(libc::EXIT_SUCCESS)
                    })
                    .map_err(|err| specific_err_to_string(&err))
            })
            .unwrap_or_else(|msg| {
                eprintln!("{}", msg);
                libc::EXIT_FAILURE
            });

        std::process::exit(code)
    }
}

fn specific_err_to_string(e: &Error) -> String {
    let (domain, cause) = if let Some(error) = e.kind::<FileError>() {
        (
            "Linux file operation error",
            match error {
                FileError::Acces => "Access permission",
                FileError::Inval => "Invalid argument",
                FileError::Nomem => "Memory allocation",
                FileError::Nxio => "No such device",
                _ => "",
            },
        )
    } else if let Some(error) = e.kind::<IsochStreamError>() {
        (
            "Isochronous stream error",
            match error {
                IsochStreamError::BusReset => "Bus reset is not recovered",
                IsochStreamError::ChannelUnavailable => "Isochronous channel is not available",
                IsochStreamError::ContextFailed => "Isochronous context fails",
                IsochStreamError::InvalidState => "Operation is not allowed in the state",
                _ => "",
            },
        )
    } else if let Some(error) = e.kind::<IsochProtocolError>() {
        (
            "Isochronous protocol error",
            match error {
                IsochProtocolError::UnsupportedConfiguration => {
                    "Sampling rate and optical mode are not supported"
                }
                IsochProtocolError::DimensionMismatch => "Data block size is unexpected",
                _ => "",
            },
        )
    } else {
        ("Unknown domain error", "")
    };
    format!("{}: {}, {}", domain, cause, e)
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt;

/// Why a connection was taken down. Reported to observers through the
/// disconnected signal; never serialized onto the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    Plugin,
    Hbri,
    BadState,
    CidChange,
    CidTaken,
    HubFull,
    /// Over-long or unterminated command line.
    InvalidCommand,
    InvalidCommandType,
    InvalidIp,
    LoginTimeout,
    NickInvalid,
    NickTaken,
    NoBandwidth,
    NoBaseSupport,
    NoTigrSupport,
    PidCidLength,
    PidCidMismatch,
    PidMissing,
    PidWithoutCid,
    SocketError,
    WriteOverflow,
    WriteTimeout,
    InvalidDescription,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Reason::Plugin => "plugin",
            Reason::Hbri => "hbri",
            Reason::BadState => "bad state",
            Reason::CidChange => "cid change",
            Reason::CidTaken => "cid taken",
            Reason::HubFull => "hub full",
            Reason::InvalidCommand => "invalid command",
            Reason::InvalidCommandType => "invalid command type",
            Reason::InvalidIp => "invalid ip",
            Reason::LoginTimeout => "login timeout",
            Reason::NickInvalid => "nick invalid",
            Reason::NickTaken => "nick taken",
            Reason::NoBandwidth => "no bandwidth",
            Reason::NoBaseSupport => "no BASE support",
            Reason::NoTigrSupport => "no TIGR support",
            Reason::PidCidLength => "pid/cid length",
            Reason::PidCidMismatch => "pid/cid mismatch",
            Reason::PidMissing => "pid missing",
            Reason::PidWithoutCid => "pid without cid",
            Reason::SocketError => "socket error",
            Reason::WriteOverflow => "write overflow",
            Reason::WriteTimeout => "write timeout",
            Reason::InvalidDescription => "invalid description",
        };
        f.write_str(s)
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! STA severities and error codes, and the builders for the STA/QUI pairs
//! the hub emits when it takes a connection down.

use crate::wire::{
    command::{AdcCommand, CMD_QUI, CMD_STA},
    tag::Sid,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Severity {
    Success = 0,
    Recoverable = 1,
    Fatal = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusCode {
    Success = 0,
    HubFull = 11,
    LoginGeneric = 20,
    NickInvalid = 21,
    NickTaken = 22,
    CidTaken = 24,
    InvalidPid = 27,
    ProtocolGeneric = 40,
    BadState = 42,
    InfMissing = 43,
    HbriTimeout = 45,
}

impl StatusCode {
    /// Address mismatch between an `I?` field and the peer address shares a
    /// code with PID failures.
    pub const BAD_IP: StatusCode = StatusCode::InvalidPid;
}

/// Builds an `ISTA` with the combined three-digit severity/code field.
pub fn sta(severity: Severity, code: StatusCode, description: &str) -> AdcCommand {
    AdcCommand::new(CMD_STA)
        .add_param1(format!("{}{:02}", severity as u8, code as u8))
        .add_param1(description)
}

/// Builds the `IQUI` that closes out a disconnecting session: `DI1`, the
/// human reason, and the reconnect hint (`-1` meaning "do not reconnect").
pub fn qui(sid: Sid, message: &str, reconnect_secs: i64) -> AdcCommand {
    AdcCommand::new(CMD_QUI)
        .add_param1(sid.to_string())
        .add_param("DI", "1")
        .add_param("MS", message)
        .add_param("TL", reconnect_secs.to_string())
}

/// The plain leave notification broadcast when a roster entity goes away.
pub fn qui_broadcast(sid: Sid) -> AdcCommand {
    AdcCommand::new(CMD_QUI)
        .add_param1(sid.to_string())
        .add_param("DI", "1")
}

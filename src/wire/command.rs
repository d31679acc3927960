// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The ADC command model: one text line per command, `\n`-terminated.
//!
//! A line is a one-byte message type, a three-byte command name, then the
//! positional header the type requires (from-sid, to-sid, feature selector)
//! followed by whitespace-separated parameters. Parameter values travel
//! escaped (`\s`, `\n`, `\\`); they are stored unescaped here and re-escaped
//! on serialization, preserving order.

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

use crate::wire::tag::Sid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandParseError {
    #[error("command line too short")]
    TooShort,
    #[error("invalid message type {0:?}")]
    InvalidType(char),
    #[error("malformed command header")]
    Malformed,
    #[error("invalid SID")]
    InvalidSid,
    #[error("invalid feature selector")]
    InvalidFeatures,
    #[error("invalid escape sequence")]
    InvalidEscape,
    #[error("parameter is not valid UTF-8")]
    InvalidUtf8,
}

/// The first byte of a command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Broadcast,
    Client,
    Direct,
    Echo,
    Feature,
    Hub,
    Info,
}

impl MsgType {
    pub fn from_byte(b: u8) -> Option<MsgType> {
        Some(match b {
            b'B' => MsgType::Broadcast,
            b'C' => MsgType::Client,
            b'D' => MsgType::Direct,
            b'E' => MsgType::Echo,
            b'F' => MsgType::Feature,
            b'H' => MsgType::Hub,
            b'I' => MsgType::Info,
            _ => return None,
        })
    }

    pub fn to_byte(self) -> u8 {
        match self {
            MsgType::Broadcast => b'B',
            MsgType::Client => b'C',
            MsgType::Direct => b'D',
            MsgType::Echo => b'E',
            MsgType::Feature => b'F',
            MsgType::Hub => b'H',
            MsgType::Info => b'I',
        }
    }

    fn has_from(self) -> bool {
        matches!(
            self,
            MsgType::Broadcast | MsgType::Direct | MsgType::Echo | MsgType::Feature
        )
    }

    fn has_to(self) -> bool {
        matches!(self, MsgType::Direct | MsgType::Echo)
    }
}

/// Delivery priority of an outgoing command. Not part of the wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Normal,
    /// Dropped instead of queued when the receiver's buffer is full.
    Low,
    /// Never delivered; lets a hook veto a command it already handled.
    Ignore,
}

/// Packs a 3-char command name.
const fn cmd3(name: &[u8; 3]) -> u32 {
    u32::from_le_bytes([name[0], name[1], name[2], 0])
}

pub const CMD_SUP: u32 = cmd3(b"SUP");
pub const CMD_STA: u32 = cmd3(b"STA");
pub const CMD_INF: u32 = cmd3(b"INF");
pub const CMD_MSG: u32 = cmd3(b"MSG");
pub const CMD_SCH: u32 = cmd3(b"SCH");
pub const CMD_RES: u32 = cmd3(b"RES");
pub const CMD_CTM: u32 = cmd3(b"CTM");
pub const CMD_RCM: u32 = cmd3(b"RCM");
pub const CMD_GPA: u32 = cmd3(b"GPA");
pub const CMD_PAS: u32 = cmd3(b"PAS");
pub const CMD_QUI: u32 = cmd3(b"QUI");
pub const CMD_SID: u32 = cmd3(b"SID");
pub const CMD_TCP: u32 = cmd3(b"TCP");

/// Escapes `value` into `out` per the ADC parameter rules.
pub fn escape_into(value: &str, out: &mut Vec<u8>) {
    for &b in value.as_bytes() {
        match b {
            b' ' => out.extend_from_slice(b"\\s"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\\' => out.extend_from_slice(b"\\\\"),
            _ => out.push(b),
        }
    }
}

/// Reverses [`escape_into`]. Any other `\`-sequence is ill-formed.
pub fn unescape(token: &[u8]) -> Result<String, CommandParseError> {
    let mut out = Vec::with_capacity(token.len());
    let mut i = 0;
    while i < token.len() {
        let b = token[i];
        if b == b'\\' {
            i += 1;
            match token.get(i) {
                Some(b's') => out.push(b' '),
                Some(b'n') => out.push(b'\n'),
                Some(b'\\') => out.push(b'\\'),
                _ => return Err(CommandParseError::InvalidEscape),
            }
        } else {
            out.push(b);
        }
        i += 1;
    }
    String::from_utf8(out).map_err(|_| CommandParseError::InvalidUtf8)
}

/// A parsed ADC command.
///
/// Parameters keep the order the sender used; named parameters carry their
/// two-character name as a prefix of the stored string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdcCommand {
    kind: MsgType,
    cmd: u32,
    from: Sid,
    to: Sid,
    features: String,
    params: Vec<String>,
    priority: Priority,
}

impl AdcCommand {
    /// A hub-originated command (`I` type, from the hub sid).
    pub fn new(cmd: u32) -> AdcCommand {
        AdcCommand {
            kind: MsgType::Info,
            cmd,
            from: Sid::HUB,
            to: Sid::INVALID,
            features: String::new(),
            params: Vec::new(),
            priority: Priority::Normal,
        }
    }

    pub fn with_type(cmd: u32, kind: MsgType, from: Sid) -> AdcCommand {
        AdcCommand {
            kind,
            cmd,
            from,
            to: Sid::INVALID,
            features: String::new(),
            params: Vec::new(),
            priority: Priority::Normal,
        }
    }

    /// Parses one line, without its terminating newline.
    pub fn parse(line: &[u8]) -> Result<AdcCommand, CommandParseError> {
        if line.len() < 4 {
            return Err(CommandParseError::TooShort);
        }
        let kind = MsgType::from_byte(line[0])
            .ok_or(CommandParseError::InvalidType(line[0] as char))?;
        let cmd = cmd3(&[line[1], line[2], line[3]]);

        let rest = &line[4..];
        let toks: Vec<&[u8]> = if rest.is_empty() {
            Vec::new()
        } else {
            if rest[0] != b' ' {
                return Err(CommandParseError::Malformed);
            }
            rest[1..].split(|&b| b == b' ').collect()
        };
        let mut tokens = toks.into_iter();

        let mut out = AdcCommand::with_type(cmd, kind, Sid::INVALID);

        if kind.has_from() {
            let tok = tokens.next().ok_or(CommandParseError::InvalidSid)?;
            out.from = Sid::from_wire(tok).ok_or(CommandParseError::InvalidSid)?;
        }
        if kind.has_to() {
            let tok = tokens.next().ok_or(CommandParseError::InvalidSid)?;
            out.to = Sid::from_wire(tok).ok_or(CommandParseError::InvalidSid)?;
        }
        if kind == MsgType::Feature {
            let tok = tokens.next().ok_or(CommandParseError::InvalidFeatures)?;
            if tok.is_empty() || tok.len() % 5 != 0 {
                return Err(CommandParseError::InvalidFeatures);
            }
            for group in tok.chunks(5) {
                if group[0] != b'+' && group[0] != b'-' {
                    return Err(CommandParseError::InvalidFeatures);
                }
            }
            out.features =
                String::from_utf8(tok.to_vec()).map_err(|_| CommandParseError::InvalidUtf8)?;
        }

        for tok in tokens {
            out.params.push(unescape(tok)?);
        }
        Ok(out)
    }

    /// The serialized line, newline included.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = Vec::with_capacity(self.encoded_size_hint());
        out.push(self.kind.to_byte());
        out.extend_from_slice(&self.cmd.to_le_bytes()[..3]);
        if self.kind.has_from() {
            out.push(b' ');
            out.extend_from_slice(&self.from.wire_bytes());
        }
        if self.kind.has_to() {
            out.push(b' ');
            out.extend_from_slice(&self.to.wire_bytes());
        }
        if self.kind == MsgType::Feature {
            out.push(b' ');
            out.extend_from_slice(self.features.as_bytes());
        }
        for p in &self.params {
            out.push(b' ');
            escape_into(p, &mut out);
        }
        out.push(b'\n');
        Bytes::from(out)
    }

    fn encoded_size_hint(&self) -> usize {
        16 + self.features.len() + self.params.iter().map(|p| p.len() + 1).sum::<usize>()
    }

    pub fn kind(&self) -> MsgType {
        self.kind
    }

    pub fn command(&self) -> u32 {
        self.cmd
    }

    /// Type byte plus command name, e.g. `BINF`.
    pub fn fourcc(&self) -> String {
        let name = self.cmd.to_le_bytes();
        let mut s = String::with_capacity(4);
        s.push(self.kind.to_byte() as char);
        for b in &name[..3] {
            s.push(*b as char);
        }
        s
    }

    pub fn from(&self) -> Sid {
        self.from
    }

    pub fn to(&self) -> Sid {
        self.to
    }

    pub fn set_from(&mut self, sid: Sid) {
        self.from = sid;
    }

    pub fn features(&self) -> &str {
        &self.features
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut Vec<String> {
        &mut self.params
    }

    /// Appends a positional parameter.
    pub fn add_param1(mut self, value: impl Into<String>) -> AdcCommand {
        self.params.push(value.into());
        self
    }

    /// Appends a named parameter.
    pub fn add_param(self, name: &str, value: impl AsRef<str>) -> AdcCommand {
        debug_assert_eq!(name.len(), 2);
        let mut s = String::with_capacity(2 + value.as_ref().len());
        s.push_str(name);
        s.push_str(value.as_ref());
        self.add_param1(s)
    }

    pub fn push_param(&mut self, name: &str, value: &str) {
        debug_assert_eq!(name.len(), 2);
        let mut s = String::with_capacity(2 + value.len());
        s.push_str(name);
        s.push_str(value);
        self.params.push(s);
    }

    /// Finds the value of the named parameter, searching from index `start`.
    pub fn param(&self, name: &str, start: usize) -> Option<&str> {
        debug_assert_eq!(name.len(), 2);
        self.params
            .iter()
            .skip(start)
            .find(|p| p.len() >= 2 && p.starts_with(name))
            .map(|p| &p[2..])
    }

    /// Removes the first occurrence of the named parameter at or after
    /// `start`; returns whether one was removed.
    pub fn del_param(&mut self, name: &str, start: usize) -> bool {
        debug_assert_eq!(name.len(), 2);
        if let Some(pos) = self
            .params
            .iter()
            .skip(start)
            .position(|p| p.len() >= 2 && p.starts_with(name))
        {
            self.params.remove(start + pos);
            true
        } else {
            false
        }
    }
}

impl fmt::Display for AdcCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.to_bytes();
        let line = String::from_utf8_lossy(&bytes[..bytes.len() - 1]);
        f.write_str(&line)
    }
}

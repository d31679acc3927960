// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Client identifiers. A PID is private to the client; the public CID is the
//! Tiger hash of the PID, which lets the hub verify ownership without ever
//! storing the PID.

use std::fmt;

use tiger::{Digest, Tiger};

use crate::wire::tag::{from_base32, to_base32};

/// A 192-bit client (or private) identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Cid([u8; Cid::SIZE]);

impl Cid {
    pub const SIZE: usize = 24;
    /// Length of the wire form: ceil(192 / 5) base-32 characters.
    pub const BASE32_SIZE: usize = 39;

    pub const ZERO: Cid = Cid([0u8; Cid::SIZE]);

    pub fn new(data: [u8; Cid::SIZE]) -> Cid {
        Cid(data)
    }

    /// Parses the 39-char base-32 wire form.
    pub fn from_base32(s: &str) -> Option<Cid> {
        if s.len() != Cid::BASE32_SIZE {
            return None;
        }
        let mut data = [0u8; Cid::SIZE];
        if !from_base32(s, &mut data) {
            return None;
        }
        Some(Cid(data))
    }

    pub fn to_base32(self) -> String {
        to_base32(&self.0)
    }

    /// Derives the public CID from a private id.
    pub fn from_pid(pid: &Cid) -> Cid {
        let digest = Tiger::digest(pid.0);
        let mut data = [0u8; Cid::SIZE];
        data.copy_from_slice(&digest);
        Cid(data)
    }

    pub fn is_zero(self) -> bool {
        self == Cid::ZERO
    }

    pub fn data(&self) -> &[u8; Cid::SIZE] {
        &self.0
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base32())
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", self.to_base32())
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The hub side of the protocol: roster and routing ([`manager`]) and the
//! per-command state machine ([`dispatch`]).

pub mod dispatch;
pub mod manager;

use crate::{
    entity::{Entity, State},
    events::Signal,
    reason::Reason,
    wire::command::AdcCommand,
};

pub use manager::ClientManager;

pub type ConnectedSlot = dyn FnMut(&mut Entity) + Send;
pub type ReceiveSlot = dyn FnMut(&mut Entity, &mut AdcCommand, &mut bool) + Send;
pub type BadLineSlot = dyn FnMut(&mut Entity, &[u8]) + Send;
pub type SendSlot = dyn FnMut(&Entity, &AdcCommand, &mut bool) + Send;
pub type StateSlot = dyn FnMut(&mut Entity, State) + Send;
pub type DisconnectedSlot = dyn FnMut(&mut Entity, Reason, &str) + Send;

/// Event tables of the client manager. Hooks run on the core task; the
/// `receive` and `send` slots carry an `ok` flag a subscriber may clear to
/// suppress default processing or a single delivery.
#[derive(Default)]
pub struct Signals {
    /// A connection was accepted.
    pub connected: Signal<ConnectedSlot>,
    /// The connection is ready for protocol traffic.
    pub ready: Signal<ConnectedSlot>,
    pub receive: Signal<ReceiveSlot>,
    pub bad_line: Signal<BadLineSlot>,
    /// Fires once per prospective recipient before a delivery.
    pub send: Signal<SendSlot>,
    /// Fires after a state change with the previous state.
    pub state: Signal<StateSlot>,
    pub disconnected: Signal<DisconnectedSlot>,
}

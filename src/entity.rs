// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-client state: identity, INF fields, supported features, the feature
//! filters derived from the `SU` field, and the cached wire encodings of
//! INF and SUP. The hub and bots reuse the same type with a different
//! delivery sink.

use std::{any::Any, collections::BTreeMap, fmt, net::IpAddr, time::Instant};

use bitflags::bitflags;
use bytes::Bytes;

use crate::{
    core::CoreHandle,
    reason::Reason,
    socket::ManagedSocket,
    wire::{
        cid::Cid,
        command::{AdcCommand, CMD_INF, CMD_SUP, MsgType, Priority},
        tag::{Sid, field_bytes, field_code, fourcc, fourcc_str},
    },
};

/// Login progress of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Initial protocol negotiation (wait for SUP).
    Protocol,
    /// Validating the secondary-protocol address.
    Hbri,
    /// Identifying the connecting client (wait for INF).
    Identify,
    /// Password check in progress (wait for PAS).
    Verify,
    /// Normal operation.
    Normal,
    /// Binary data transfer.
    Data,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u32 {
        const BOT = 0x01;
        const REGISTERED = 0x02;
        const OP = 0x04;
        const SU = 0x08;
        const OWNER = 0x10;
        const HUB = 0x20;
        const HIDDEN = 0x40;
        /// Bits mirrored into the `CT` field.
        const MASK_CLIENT_TYPE = 0x7f;

        const PASSWORD = 0x100;
        /// Extended away, no need to deliver messages.
        const EXT_AWAY = 0x200;
        /// Bypass the IP check.
        const OK_IP = 0x400;
        /// Being disconnected; unreachable by routing and blind to events.
        const GHOST = 0x800;
        /// The login-phase INF advertised an address on the other protocol.
        const VALIDATE_HBRI = 0x1000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityType {
    Client,
    Bot,
    Hub,
}

/// Sink for a bot entity's outgoing traffic.
pub type SendHandler = Box<dyn FnMut(&Bytes) + Send>;

/// Consumer installed while a connection is in DATA mode.
pub type DataHandler = Box<dyn FnMut(&Bytes) + Send>;

pub enum EntityKind {
    Client(ManagedSocket),
    Bot(SendHandler),
    Hub,
}

/// Handle to a per-entity extension slot, issued at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PluginDataKey(u64);

impl PluginDataKey {
    pub(crate) fn new(id: u64) -> PluginDataKey {
        PluginDataKey(id)
    }
}

pub struct Entity {
    sid: Sid,
    cid: Cid,
    state: State,
    flags: Flags,

    /// INF fields keyed by their packed 2-char code.
    fields: BTreeMap<u16, String>,
    /// Hub-level SUP feature list, in arrival order.
    supports: Vec<u32>,
    /// Feature filters derived from the `SU` field.
    filters: Vec<u32>,

    inf_cache: Option<Bytes>,
    sup_cache: Option<Bytes>,

    kind: EntityKind,
    handle: CoreHandle,

    plugin_data: BTreeMap<PluginDataKey, Box<dyn Any + Send>>,

    data_handler: Option<DataHandler>,
    data_expected: usize,
}

impl Entity {
    fn new(sid: Sid, kind: EntityKind, handle: CoreHandle) -> Entity {
        Entity {
            sid,
            cid: Cid::ZERO,
            state: State::Protocol,
            flags: Flags::empty(),
            fields: BTreeMap::new(),
            supports: Vec::new(),
            filters: Vec::new(),
            inf_cache: None,
            sup_cache: None,
            kind,
            handle,
            plugin_data: BTreeMap::new(),
            data_handler: None,
            data_expected: 0,
        }
    }

    pub fn new_client(sid: Sid, socket: ManagedSocket, handle: CoreHandle) -> Entity {
        Entity::new(sid, EntityKind::Client(socket), handle)
    }

    pub fn new_bot(sid: Sid, handler: SendHandler, handle: CoreHandle) -> Entity {
        let mut e = Entity::new(sid, EntityKind::Bot(handler), handle);
        e.set_flag(Flags::BOT);
        e
    }

    pub fn new_hub(handle: CoreHandle) -> Entity {
        let mut e = Entity::new(Sid::HUB, EntityKind::Hub, handle);
        e.set_flag(Flags::HUB);
        e
    }

    pub fn sid(&self) -> Sid {
        self.sid
    }

    pub fn cid(&self) -> Cid {
        self.cid
    }

    pub fn set_cid(&mut self, cid: Cid) {
        self.cid = cid;
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn set_state(&mut self, state: State) {
        self.state = state;
    }

    pub fn entity_type(&self) -> EntityType {
        match self.kind {
            EntityKind::Client(_) => EntityType::Client,
            EntityKind::Bot(_) => EntityType::Bot,
            EntityKind::Hub => EntityType::Hub,
        }
    }

    pub fn socket(&self) -> Option<&ManagedSocket> {
        match &self.kind {
            EntityKind::Client(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_set(&self, flag: Flags) -> bool {
        self.flags.contains(flag)
    }

    pub fn is_any_set(&self, flags: Flags) -> bool {
        self.flags.intersects(flags)
    }

    pub fn set_flag(&mut self, flag: Flags) {
        self.flags |= flag;
        if flag.intersects(Flags::MASK_CLIENT_TYPE) {
            let ct = (self.flags & Flags::MASK_CLIENT_TYPE).bits();
            self.set_field("CT", &ct.to_string());
        }
    }

    pub fn unset_flag(&mut self, flag: Flags) {
        self.flags -= flag;
        if flag.intersects(Flags::MASK_CLIENT_TYPE) {
            let ct = (self.flags & Flags::MASK_CLIENT_TYPE).bits();
            self.set_field("CT", &ct.to_string());
        }
    }

    pub fn field(&self, name: &str) -> &str {
        debug_assert_eq!(name.len(), 2);
        let code = field_code(name.as_bytes().try_into().unwrap_or(&[0, 0]));
        self.fields.get(&code).map_or("", String::as_str)
    }

    pub fn has_field(&self, name: &str) -> bool {
        !self.field(name).is_empty()
    }

    /// Sets (or, for an empty value, removes) an INF field and invalidates
    /// the cached INF. A `SU` write also rederives the feature filters: the
    /// value must be `k` comma-joined fourCCs (length `5k-1`) or empty,
    /// otherwise the filters are cleared while the field stays as given.
    pub fn set_field(&mut self, name: &str, value: &str) {
        debug_assert_eq!(name.len(), 2);
        let code = field_code(name.as_bytes().try_into().unwrap_or(&[0, 0]));
        self.set_field_code(code, value);
    }

    fn set_field_code(&mut self, code: u16, value: &str) {
        if code == field_code(b"SU") {
            self.filters.clear();
            let bytes = value.as_bytes();
            if (bytes.len() + 1) % 5 == 0 {
                self.filters.reserve((bytes.len() + 1) / 5);
                for i in (0..bytes.len()).step_by(5) {
                    if let Ok(tag) = bytes[i..i + 4].try_into() {
                        self.filters.push(fourcc(tag));
                    }
                }
            }
        }

        if value.is_empty() {
            self.fields.remove(&code);
        } else {
            self.fields.insert(code, value.to_string());
        }
        self.inf_cache = None;
    }

    /// Applies every named parameter of `cmd` as an INF field, except `PD`
    /// which must never be stored or propagated.
    pub fn update_fields(&mut self, cmd: &AdcCommand) {
        for p in cmd.params() {
            if p.len() < 2 || !p.is_char_boundary(2) {
                continue;
            }
            let code = field_code(p.as_bytes()[..2].try_into().unwrap_or(&[0, 0]));
            if code != field_code(b"PD") {
                self.set_field_code(code, &p[2..]);
            }
        }
    }

    /// The serialized INF broadcast for this entity; `I`-typed for the hub,
    /// `B`-typed otherwise. Rebuilt lazily after field mutations.
    pub fn get_inf(&mut self) -> Bytes {
        if self.inf_cache.is_none() {
            let kind = if self.sid.is_hub() {
                MsgType::Info
            } else {
                MsgType::Broadcast
            };
            let mut cmd = AdcCommand::with_type(CMD_INF, kind, self.sid);
            for (code, value) in &self.fields {
                let name = field_bytes(*code);
                let name = std::str::from_utf8(&name).unwrap_or("??");
                cmd.push_param(name, value);
            }
            self.inf_cache = Some(cmd.to_bytes());
        }
        self.inf_cache.clone().unwrap_or_default()
    }

    pub fn add_supports(&mut self, feature: u32) -> bool {
        if self.supports.contains(&feature) {
            return false;
        }
        self.supports.push(feature);
        self.sup_cache = None;
        true
    }

    pub fn remove_supports(&mut self, feature: u32) -> bool {
        let Some(pos) = self.supports.iter().position(|&f| f == feature) else {
            return false;
        };
        self.supports.remove(pos);
        self.sup_cache = None;
        true
    }

    pub fn has_support(&self, feature: u32) -> bool {
        self.supports.contains(&feature)
    }

    pub fn support_list(&self) -> Vec<String> {
        self.supports.iter().map(|&f| fourcc_str(f)).collect()
    }

    /// Applies `AD`/`RM` tokens from a SUP command.
    pub fn update_supports(&mut self, cmd: &AdcCommand) {
        for p in cmd.params() {
            let bytes = p.as_bytes();
            if bytes.len() != 6 {
                continue;
            }
            if let Ok(tag) = bytes[2..6].try_into() {
                match &bytes[..2] {
                    b"AD" => {
                        self.add_supports(fourcc(tag));
                    }
                    b"RM" => {
                        self.remove_supports(fourcc(tag));
                    }
                    _ => {}
                }
            }
        }
    }

    /// The serialized SUP for this entity, rebuilt lazily.
    pub fn get_sup(&mut self) -> Bytes {
        if self.sup_cache.is_none() {
            let kind = if self.sid.is_hub() {
                MsgType::Info
            } else {
                MsgType::Broadcast
            };
            let mut cmd = AdcCommand::with_type(CMD_SUP, kind, self.sid);
            for &f in &self.supports {
                cmd.push_param("AD", &fourcc_str(f));
            }
            self.sup_cache = Some(cmd.to_bytes());
        }
        self.sup_cache.clone().unwrap_or_default()
    }

    pub fn has_filter(&self, feature: u32) -> bool {
        self.filters.contains(&feature)
    }

    /// Drops a feature from the client-advertised filters, rewriting the
    /// `SU` field to match.
    pub fn remove_filter(&mut self, feature: u32) -> bool {
        let Some(pos) = self.filters.iter().position(|&f| f == feature) else {
            return false;
        };
        self.filters.remove(pos);
        let su = self
            .filters
            .iter()
            .map(|&f| fourcc_str(f))
            .collect::<Vec<_>>()
            .join(",");
        self.set_field("SU", &su);
        true
    }

    /// Whether a feature-typed command with this selector must be withheld
    /// from the entity: a `-X` it advertises, or a `+X` it lacks. Entities
    /// that never advertised filters receive no feature casts at all.
    pub fn is_filtered(&self, features: &str) -> bool {
        if self.filters.is_empty() {
            return true;
        }
        let bytes = features.as_bytes();
        for i in (0..bytes.len()).step_by(5) {
            let Some(group) = bytes.get(i..i + 5) else {
                break;
            };
            let Ok(tag) = group[1..5].try_into() else {
                break;
            };
            let tag = fourcc(tag);
            match group[0] {
                b'-' if self.filters.contains(&tag) => return true,
                b'+' if !self.filters.contains(&tag) => return true,
                _ => {}
            }
        }
        false
    }

    pub fn send(&mut self, cmd: &AdcCommand) {
        let low_prio = cmd.priority() == Priority::Low;
        if cmd.priority() == Priority::Ignore {
            return;
        }
        self.send_buffer(&cmd.to_bytes(), low_prio);
    }

    /// Queues an already-encoded buffer; shared broadcast buffers arrive
    /// here once per recipient.
    pub fn send_buffer(&mut self, buf: &Bytes, low_prio: bool) {
        match &mut self.kind {
            EntityKind::Client(socket) => socket.enqueue(buf.clone(), low_prio),
            EntityKind::Bot(handler) => handler(buf),
            EntityKind::Hub => {}
        }
    }

    /// Requests disconnection. For clients this defers to the socket; bots
    /// are detached through the job queue so the removal never reenters the
    /// handler that asked for it.
    pub fn disconnect(&mut self, reason: Reason, info: &str) {
        match &self.kind {
            EntityKind::Client(socket) => socket.disconnect(reason, info),
            EntityKind::Bot(_) => {
                let sid = self.sid;
                let info = info.to_string();
                self.handle.post(move |cm| cm.on_failed(sid, reason, &info));
            }
            EntityKind::Hub => {}
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.socket().map(ManagedSocket::ip)
    }

    pub fn is_v6(&self) -> bool {
        self.socket().is_some_and(ManagedSocket::is_v6)
    }

    /// Bytes waiting in this entity's write buffer.
    pub fn queued_bytes(&self) -> usize {
        self.socket().map_or(0, ManagedSocket::queued_bytes)
    }

    /// When the write buffer exceeded its cap, if it still does.
    pub fn overflow(&self) -> Option<Instant> {
        self.socket().and_then(ManagedSocket::overflow)
    }

    /// Switches the connection into DATA mode: the next `bytes` bytes are
    /// handed to `handler` verbatim, then line handling resumes.
    pub fn set_data_mode(&mut self, handler: DataHandler, bytes: usize) {
        if let EntityKind::Client(socket) = &self.kind {
            socket.set_data_mode(bytes);
            self.data_handler = Some(handler);
            self.data_expected = bytes;
            self.state = State::Data;
        }
    }

    /// Feeds DATA-mode input; returns to NORMAL once the declared count has
    /// been delivered.
    pub(crate) fn feed_data(&mut self, data: &Bytes) {
        if let Some(handler) = &mut self.data_handler {
            handler(data);
        }
        self.data_expected = self.data_expected.saturating_sub(data.len());
        if self.data_expected == 0 {
            self.data_handler = None;
            if self.state == State::Data {
                self.state = State::Normal;
            }
        }
    }

    pub fn set_plugin_data(&mut self, key: PluginDataKey, value: Box<dyn Any + Send>) {
        self.plugin_data.insert(key, value);
    }

    pub fn plugin_data(&self, key: PluginDataKey) -> Option<&(dyn Any + Send)> {
        self.plugin_data.get(&key).map(AsRef::as_ref)
    }

    pub fn clear_plugin_data(&mut self, key: PluginDataKey) {
        self.plugin_data.remove(&key);
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("sid", &self.sid)
            .field("cid", &self.cid)
            .field("state", &self.state)
            .field("flags", &self.flags)
            .field("type", &self.entity_type())
            .finish_non_exhaustive()
    }
}

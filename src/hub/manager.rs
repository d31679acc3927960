// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The client manager owns every live entity, keeps the identity maps
//! consistent, and routes commands by type. All of its methods run on the
//! core task; connections talk to it exclusively through posted jobs.

use std::{
    collections::{HashMap, VecDeque},
    time::Instant,
};

use bytes::Bytes;
use rand::RngExt;
use tiger::{Digest, Tiger};
use tracing::{debug, info};

use crate::{
    cfg::config::HubConfig,
    core::CoreHandle,
    entity::{Entity, EntityType, Flags, PluginDataKey, SendHandler, State},
    hub::Signals,
    reason::Reason,
    socket::ManagedSocket,
    wire::{
        cid::Cid,
        command::{AdcCommand, CMD_GPA, CMD_SID, MsgType, Priority},
        status::{Severity, StatusCode, qui, qui_broadcast, sta},
        tag::{Sid, fourcc, from_base32, to_base32},
    },
};

pub(crate) struct HbriToken {
    pub sid: Sid,
    pub issued: Instant,
}

pub struct ClientManager {
    pub(crate) cfg: std::sync::Arc<HubConfig>,
    pub(crate) handle: CoreHandle,

    /// The pseudo-entity representing the hub itself (SID `AAAA`).
    pub(crate) hub: Entity,

    /// Every live entity, owned here. Roster membership is `state == NORMAL`.
    pub(crate) peers: HashMap<Sid, Entity>,
    /// Connections still logging in, oldest first, with their connect time.
    pub(crate) logins: VecDeque<(Sid, Instant)>,
    /// Outstanding HBRI validation tokens.
    pub(crate) hbri_tokens: HashMap<String, HbriToken>,

    pub(crate) nicks: HashMap<String, Sid>,
    pub(crate) cids: HashMap<Cid, Sid>,

    pub signals: Signals,

    next_plugin_key: u64,
}

impl ClientManager {
    pub fn new(cfg: std::sync::Arc<HubConfig>, handle: CoreHandle) -> ClientManager {
        let mut hub = Entity::new_hub(handle.clone());
        hub.set_state(State::Normal);
        if !cfg.hub_name.is_empty() {
            hub.set_field("NI", &cfg.hub_name);
        }
        if !cfg.description.is_empty() {
            hub.set_field("DE", &cfg.description);
        }
        hub.set_field("VE", concat!("adc-hub-rs ", env!("CARGO_PKG_VERSION")));

        ClientManager {
            cfg,
            handle,
            hub,
            peers: HashMap::new(),
            logins: VecDeque::new(),
            hbri_tokens: HashMap::new(),
            nicks: HashMap::new(),
            cids: HashMap::new(),
            signals: Signals::default(),
            next_plugin_key: 0,
        }
    }

    /// Declares the hub's own feature set.
    pub fn prepare_supports(&mut self, add_hbri: bool) {
        self.hub.add_supports(fourcc(b"BASE"));
        self.hub.add_supports(fourcc(b"TIGR"));
        if add_hbri {
            self.hub.add_supports(fourcc(b"HBRI"));
        }
    }

    /// Registers a per-entity extension slot and returns its handle.
    pub fn register_plugin_data(&mut self) -> PluginDataKey {
        let key = PluginDataKey::new(self.next_plugin_key);
        self.next_plugin_key += 1;
        key
    }

    pub fn handle(&self) -> &CoreHandle {
        &self.handle
    }

    pub fn hub_entity(&self) -> &Entity {
        &self.hub
    }

    pub fn hub_entity_mut(&mut self) -> &mut Entity {
        &mut self.hub
    }

    /// The entity behind a SID: the hub itself, or a roster member. Entities
    /// still logging in are not addressable.
    pub fn get_entity(&self, sid: Sid) -> Option<&Entity> {
        if sid.is_invalid() {
            return None;
        }
        if sid.is_hub() {
            return Some(&self.hub);
        }
        self.peers
            .get(&sid)
            .filter(|e| e.state() == State::Normal && !e.is_set(Flags::GHOST))
    }

    pub fn sid_by_nick(&self, nick: &str) -> Option<Sid> {
        self.nicks.get(nick).copied()
    }

    pub fn sid_by_cid(&self, cid: &Cid) -> Option<Sid> {
        self.cids.get(cid).copied()
    }

    /// Number of entities in the roster.
    pub fn roster_len(&self) -> usize {
        self.roster().count()
    }

    pub(crate) fn roster(&self) -> impl Iterator<Item = &Entity> {
        self.peers
            .values()
            .filter(|e| e.state() == State::Normal && !e.is_set(Flags::GHOST))
    }

    fn roster_mut(&mut self) -> impl Iterator<Item = &mut Entity> {
        self.peers
            .values_mut()
            .filter(|e| e.state() == State::Normal && !e.is_set(Flags::GHOST))
    }

    /// Total bytes queued across all roster connections.
    pub fn queued_bytes(&self) -> usize {
        self.roster().map(Entity::queued_bytes).sum()
    }

    /// Allocates an unused, non-zero session id.
    pub(crate) fn make_sid(&self) -> Sid {
        let mut rng = rand::rng();
        loop {
            let sid = Sid::from_bits(rng.random());
            if !sid.is_invalid() && !sid.is_hub() && !self.peers.contains_key(&sid) {
                return sid;
            }
        }
    }

    /// Adopts a freshly accepted connection: allocates a SID, creates the
    /// entity in PROTOCOL state, queues it for the login timeout and starts
    /// socket I/O.
    pub fn handle_incoming(&mut self, socket: ManagedSocket) {
        let sid = self.make_sid();
        debug!(%sid, ip = %socket.ip(), "incoming connection");

        let mut e = Entity::new_client(sid, socket.clone(), self.handle.clone());
        self.logins.push_back((sid, Instant::now()));
        for slot in self.signals.connected.slots_mut() {
            slot(&mut e);
        }
        for slot in self.signals.ready.slots_mut() {
            slot(&mut e);
        }
        self.peers.insert(sid, e);
        socket.start(sid);
    }

    /// A complete line arrived from `sid`. Parses it, runs it through the
    /// state machine, and routes the result by type.
    pub fn on_line(&mut self, sid: Sid, line: Bytes) {
        let Some(mut e) = self.peers.remove(&sid) else {
            return;
        };
        if e.is_set(Flags::GHOST) {
            self.peers.insert(sid, e);
            return;
        }

        let routed = match AdcCommand::parse(&line) {
            Ok(mut cmd) => {
                if self.on_receive(&mut e, &mut cmd) {
                    Some(cmd)
                } else {
                    None
                }
            }
            Err(err) => {
                debug!(%sid, %err, "unparsable command line");
                self.disconnect_with(
                    &mut e,
                    Reason::InvalidCommand,
                    StatusCode::ProtocolGeneric,
                    "Malformed command line",
                    None,
                    -1,
                );
                None
            }
        };

        if !e.is_set(Flags::GHOST) {
            self.peers.insert(sid, e);
        }
        if let Some(cmd) = routed {
            self.send(&cmd);
        }
    }

    fn on_receive(&mut self, e: &mut Entity, cmd: &mut AdcCommand) -> bool {
        match cmd.kind() {
            MsgType::Broadcast | MsgType::Direct | MsgType::Echo | MsgType::Feature => {
                if cmd.from() != e.sid() {
                    self.disconnect_with(
                        e,
                        Reason::InvalidCommand,
                        StatusCode::ProtocolGeneric,
                        "Invalid source SID",
                        None,
                        -1,
                    );
                    return false;
                }
            }
            MsgType::Hub => {}
            MsgType::Info | MsgType::Client => {
                self.disconnect_with(
                    e,
                    Reason::InvalidCommandType,
                    StatusCode::ProtocolGeneric,
                    "Invalid command type",
                    None,
                    -1,
                );
                return false;
            }
        }

        let mut ok = true;
        for slot in self.signals.receive.slots_mut() {
            slot(e, cmd, &mut ok);
        }
        if ok && !self.dispatch(e, cmd) {
            return false;
        }
        true
    }

    /// An over-long or unterminated line: notify observers, then cut the
    /// connection with the fatal STA/QUI pair.
    pub fn on_bad_line(&mut self, sid: Sid, line: &Bytes) {
        let Some(mut e) = self.peers.remove(&sid) else {
            return;
        };
        if !e.is_set(Flags::GHOST) {
            for slot in self.signals.bad_line.slots_mut() {
                slot(&mut e, line);
            }
            self.disconnect_with(
                &mut e,
                Reason::InvalidCommand,
                StatusCode::ProtocolGeneric,
                "Command too long",
                None,
                -1,
            );
        }
        if !e.is_set(Flags::GHOST) {
            self.peers.insert(sid, e);
        }
    }

    /// DATA-mode bytes for the entity's installed consumer.
    pub fn on_data(&mut self, sid: Sid, data: Bytes) {
        if let Some(e) = self.peers.get_mut(&sid) {
            e.feed_data(&data);
        }
    }

    /// A connection reported its failure; the entity leaves the hub.
    pub fn on_failed(&mut self, sid: Sid, reason: Reason, info: &str) {
        if let Some(mut e) = self.peers.remove(&sid) {
            self.remove_entity(&mut e, reason, info);
        }
    }

    /// Routes a command by its message type.
    pub fn send(&mut self, cmd: &AdcCommand) {
        if cmd.priority() == Priority::Ignore {
            return;
        }
        let low_prio = cmd.priority() == Priority::Low;
        match cmd.kind() {
            MsgType::Broadcast | MsgType::Feature => {
                let all = cmd.kind() == MsgType::Broadcast;
                let buf = cmd.to_bytes();
                let signals = &mut self.signals;
                for e in self
                    .peers
                    .values_mut()
                    .filter(|e| e.state() == State::Normal && !e.is_set(Flags::GHOST))
                {
                    if !all && e.is_filtered(cmd.features()) {
                        continue;
                    }
                    let mut ok = true;
                    for slot in signals.send.slots_mut() {
                        slot(e, cmd, &mut ok);
                    }
                    if ok {
                        e.send_buffer(&buf, low_prio);
                    }
                }
            }
            MsgType::Direct | MsgType::Echo => {
                let buf = cmd.to_bytes();
                if self.maybe_send_one(cmd.to(), cmd, &buf, low_prio)
                    && cmd.kind() == MsgType::Echo
                {
                    self.maybe_send_one(cmd.from(), cmd, &buf, low_prio);
                }
            }
            MsgType::Hub | MsgType::Info | MsgType::Client => {}
        }
    }

    fn maybe_send_one(&mut self, sid: Sid, cmd: &AdcCommand, buf: &Bytes, low_prio: bool) -> bool {
        if sid.is_hub() {
            // the hub reads its copy right here; nothing to queue
            return true;
        }
        let signals = &mut self.signals;
        let Some(e) = self
            .peers
            .get_mut(&sid)
            .filter(|e| e.state() == State::Normal && !e.is_set(Flags::GHOST))
        else {
            return false;
        };
        let mut ok = true;
        for slot in signals.send.slots_mut() {
            slot(e, cmd, &mut ok);
        }
        if ok {
            e.send_buffer(buf, low_prio);
        }
        true
    }

    /// Hands the same buffer to every roster entity.
    pub fn send_to_all(&mut self, buf: &Bytes) {
        for e in self.roster_mut() {
            e.send_buffer(buf, false);
        }
    }

    /// Sends a buffer to one entity regardless of message type.
    pub fn send_to(&mut self, sid: Sid, buf: &Bytes) {
        if let Some(e) = self.peers.get_mut(&sid) {
            e.send_buffer(buf, false);
        }
    }

    pub(crate) fn set_state(&mut self, e: &mut Entity, state: State) {
        let old = e.state();
        e.set_state(state);
        for slot in self.signals.state.slots_mut() {
            slot(e, old);
        }
    }

    /// Sends the fatal STA / QUI pair and requests disconnection.
    pub(crate) fn disconnect_with(
        &mut self,
        e: &mut Entity,
        reason: Reason,
        code: StatusCode,
        info: &str,
        extra_param: Option<String>,
        reconnect_secs: i64,
    ) {
        let mut status = sta(Severity::Fatal, code, info);
        if let Some(extra) = extra_param {
            status = status.add_param1(extra);
        }
        e.send(&status);
        e.send(&qui(e.sid(), info, reconnect_secs));
        e.disconnect(reason, info);
    }

    pub(crate) fn bad_state(&mut self, e: &mut Entity, cmd: &AdcCommand) {
        self.disconnect_with(
            e,
            Reason::BadState,
            StatusCode::BadState,
            "Invalid state for command",
            Some(format!("FC{}", cmd.fourcc())),
            -1,
        );
    }

    /// Sends the hub's SUP, the allocated SID and the hub INF, then moves
    /// the entity into IDENTIFY.
    pub(crate) fn enter_identify(&mut self, e: &mut Entity, send_data: bool) {
        debug_assert_eq!(e.state(), State::Protocol);
        debug!(sid = %e.sid(), "entering IDENTIFY");
        if send_data {
            let sup = self.hub.get_sup();
            e.send_buffer(&sup, false);
            e.send(&AdcCommand::new(CMD_SID).add_param1(e.sid().to_string()));
            let inf = self.hub.get_inf();
            e.send_buffer(&inf, false);
        }
        self.set_state(e, State::Identify);
    }

    /// Issues a password challenge and moves the entity into VERIFY.
    /// Returns the salt that [`verify_password`](Self::verify_password)
    /// expects back.
    pub fn enter_verify(&mut self, e: &mut Entity, send_data: bool) -> Vec<u8> {
        debug_assert_eq!(e.state(), State::Identify);
        debug!(sid = %e.sid(), "entering VERIFY");

        const CHALLENGE_SIZE: usize = 32;
        let mut salt = vec![0u8; CHALLENGE_SIZE];
        rand::rng().fill(&mut salt[..]);

        if send_data {
            e.send(&AdcCommand::new(CMD_GPA).add_param1(to_base32(&salt)));
        }
        self.set_state(e, State::Verify);
        salt
    }

    /// Completes the login: the entity gets the roster INFs, everyone gets
    /// its INF, and it becomes part of the roster. Returns false when entry
    /// was deferred for HBRI validation.
    pub fn enter_normal(&mut self, e: &mut Entity, send_data: bool, send_own_inf: bool) -> bool {
        if e.entity_type() == EntityType::Client && e.is_set(Flags::VALIDATE_HBRI) {
            if self.send_hbri(e) {
                return false;
            }
            e.unset_flag(Flags::VALIDATE_HBRI);
        }

        debug!(sid = %e.sid(), "entering NORMAL");

        if send_data {
            for p in self
                .peers
                .values_mut()
                .filter(|p| p.state() == State::Normal && !p.is_set(Flags::GHOST))
            {
                e.send_buffer(&p.get_inf(), false);
            }
        }

        if send_own_inf {
            let inf = e.get_inf();
            self.send_to_all(&inf);
            if send_data {
                e.send_buffer(&inf, false);
            }
        }

        self.remove_logins(e.sid());
        self.set_state(e, State::Normal);
        true
    }

    pub(crate) fn remove_logins(&mut self, sid: Sid) {
        self.logins.retain(|(s, _)| *s != sid);
        self.hbri_tokens.retain(|_, t| t.sid != sid);
    }

    /// Detaches an entity from the hub: marks it GHOST, notifies observers,
    /// and for roster members broadcasts the leave. Identity maps are
    /// released only if they still point at this entity.
    pub(crate) fn remove_entity(&mut self, e: &mut Entity, reason: Reason, info: &str) {
        if e.is_set(Flags::GHOST) {
            return;
        }
        debug!(sid = %e.sid(), %reason, info, "removing entity");
        e.set_flag(Flags::GHOST);

        for slot in self.signals.disconnected.slots_mut() {
            slot(e, reason, info);
        }

        if e.state() == State::Normal {
            self.send_to_all(&qui_broadcast(e.sid()).to_bytes());
        }
        self.remove_logins(e.sid());

        let nick = e.field("NI");
        if !nick.is_empty() && self.nicks.get(nick) == Some(&e.sid()) {
            self.nicks.remove(nick);
        }
        if !e.cid().is_zero() && self.cids.get(&e.cid()) == Some(&e.sid()) {
            self.cids.remove(&e.cid());
        }
    }

    /// Creates a bot entity in IDENTIFY state. Set its nick, CID and fields,
    /// then call [`reg_bot`](Self::reg_bot).
    pub fn create_bot(&mut self, handler: SendHandler) -> Sid {
        let sid = self.make_sid();
        let mut e = Entity::new_bot(sid, handler, self.handle.clone());
        self.enter_identify(&mut e, false);
        self.peers.insert(sid, e);
        sid
    }

    /// Promotes a prepared bot into the roster.
    pub fn reg_bot(&mut self, sid: Sid) {
        let Some(mut e) = self.peers.remove(&sid) else {
            return;
        };
        self.enter_normal(&mut e, false, true);
        if !e.cid().is_zero() {
            self.cids.insert(e.cid(), sid);
        }
        let nick = e.field("NI");
        if !nick.is_empty() {
            self.nicks.insert(nick.to_string(), sid);
        }
        info!(%sid, nick = e.field("NI"), "bot registered");
        self.peers.insert(sid, e);
    }

    /// Direct access for handlers that operate on arbitrary entities; unlike
    /// [`get_entity`](Self::get_entity) this sees logging-in entities too.
    pub fn peer_mut(&mut self, sid: Sid) -> Option<&mut Entity> {
        self.peers.get_mut(&sid)
    }

    /// Checks a password response against the challenge salt:
    /// `Tiger(password ‖ salt)` must match the supplied base-32 hash.
    pub fn verify_password(&self, password: &str, salt: &[u8], supplied: &str) -> bool {
        let mut tiger = Tiger::new();
        tiger.update(password.as_bytes());
        tiger.update(salt);
        let digest = tiger.finalize();

        let mut expected = [0u8; 24];
        if !from_base32(supplied, &mut expected) {
            return false;
        }
        digest.as_slice() == expected
    }

    /// The 1-second housekeeping tick: HBRI token expiry and login
    /// deadlines. Write stalls are clocked inside each connection.
    pub fn on_timer_second(&mut self) {
        let hbri_timeout = self.cfg.hbri_timeout;
        let expired: Vec<(String, Sid)> = self
            .hbri_tokens
            .iter()
            .filter(|(_, t)| t.issued.elapsed() > hbri_timeout)
            .map(|(token, t)| (token.clone(), t.sid))
            .collect();
        for (token, sid) in expired {
            self.hbri_tokens.remove(&token);
            let Some(mut e) = self.peers.remove(&sid) else {
                continue;
            };
            debug!(%sid, state = ?e.state(), "HBRI validation timed out");
            let proto = if e.is_v6() { "IPv4" } else { "IPv6" };
            e.send(&sta(
                Severity::Recoverable,
                StatusCode::HbriTimeout,
                &format!("{proto} validation timed out"),
            ));
            self.fail_hbri(&mut e);
            if !e.is_set(Flags::GHOST) {
                self.peers.insert(sid, e);
            }
        }

        let login_timeout = self.cfg.log_timeout;
        while let Some(&(sid, since)) = self.logins.front() {
            if since.elapsed() <= login_timeout {
                break;
            }
            self.logins.pop_front();
            if let Some(e) = self.peers.get_mut(&sid) {
                debug!(%sid, state = ?e.state(), "login timeout");
                e.disconnect(Reason::LoginTimeout, "Login timeout");
            }
        }
    }
}

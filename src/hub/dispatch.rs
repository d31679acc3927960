// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Command-specific handlers behind the state-machine gate: SUP and INF
//! drive the login sequence, TCP completes HBRI validation, everything else
//! is admitted only in NORMAL and handed back to routing.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use rand::RngExt;
use tracing::debug;

use crate::{
    entity::{Entity, EntityType, Flags, State},
    hub::manager::{ClientManager, HbriToken},
    reason::Reason,
    wire::{
        cid::Cid,
        command::{
            AdcCommand, CMD_INF, CMD_SUP, CMD_TCP, MsgType,
        },
        status::{Severity, StatusCode, sta},
        tag::{Sid, fourcc},
    },
};

/// True when every byte of `s` is at or above `min`. Multi-byte UTF-8
/// sequences pass any `min` below 0x80.
fn validate_charset(s: &str, min: u8) -> bool {
    s.bytes().all(|b| b >= min)
}

fn is_bad_nick_char(c: char) -> bool {
    // letter-like symbols are explicitly allowed
    if ('\u{2100}'..='\u{214f}').contains(&c) {
        return false;
    }
    // the soft hyphen invites impersonation
    if c == '\u{00ad}' {
        return true;
    }
    c.is_control()
}

fn validate_nick(nick: &str) -> bool {
    // chars < 33 forbidden, including the space char
    if !validate_charset(nick, 33) {
        return false;
    }
    nick.chars().all(|c| !is_bad_nick_char(c))
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(a) => {
            let o = a.octets();
            o[0] == 10
                || o[0] == 127
                || (o[0] == 172 && (16..32).contains(&o[1]))
                || (o[0] == 192 && o[1] == 168)
        }
        IpAddr::V6(a) => (a.segments()[0] & 0xffc0) == 0xfe80,
    }
}

fn family_name(v6: bool) -> &'static str {
    if v6 { "IPv6" } else { "IPv4" }
}

/// Parses an `I4`/`I6` parameter value in the given family. An empty value
/// counts as unspecified; a value of the wrong family is an error.
fn parse_family(value: &str, v6: bool) -> Result<Option<IpAddr>, String> {
    if value.is_empty() {
        return Ok(None);
    }
    let parsed = if v6 {
        value.parse::<Ipv6Addr>().map(IpAddr::V6)
    } else {
        value.parse::<Ipv4Addr>().map(IpAddr::V4)
    };
    match parsed {
        Ok(ip) if ip.is_unspecified() => Ok(None),
        Ok(ip) => Ok(Some(ip)),
        Err(_) => Err(format!(
            "The configured IP {value} isn't a valid {} address",
            family_name(v6)
        )),
    }
}

/// Checks the `I?` fields of an INF against the peer address. The own-family
/// address must match the peer (private/loopback peers are trusted); an
/// absent or unspecified one is filled in. Presence of a specified
/// opposite-family address asks for HBRI validation; otherwise the
/// opposite-family address and port are dropped.
fn validate_ip_fields(
    cmd: &mut AdcCommand,
    remote: IpAddr,
    v6: bool,
) -> Result<bool, String> {
    let is_local = is_private_ip(&remote);
    let primary_name = if v6 { "I6" } else { "I4" };

    match cmd.param(primary_name, 0).map(str::to_string) {
        Some(value) => match parse_family(&value, v6)? {
            Some(ip) if ip != remote && !is_local => {
                return Err(format!(
                    "Your IP is {remote}, reconfigure your client settings"
                ));
            }
            Some(_) => {}
            None => {
                cmd.del_param(primary_name, 0);
                cmd.push_param(primary_name, &remote.to_string());
            }
        },
        None => cmd.push_param(primary_name, &remote.to_string()),
    }

    let secondary_name = if v6 { "I4" } else { "I6" };
    let secondary_port = if v6 { "U4" } else { "U6" };
    let secondary = cmd.param(secondary_name, 0).map(str::to_string);
    let validate_secondary = secondary.as_deref().is_some_and(|s| !s.is_empty());

    let parsed_secondary = match secondary.as_deref() {
        Some(value) => parse_family(value, !v6)?,
        None => None,
    };

    // A local user keeps its secondary address as given; anyone else gets it
    // stripped until HBRI has confirmed reachability.
    if !is_local || !validate_secondary || parsed_secondary.is_none() {
        cmd.del_param(secondary_port, 0);
        cmd.del_param(secondary_name, 0);
    }

    Ok(validate_secondary)
}

impl ClientManager {
    pub(crate) fn dispatch(&mut self, e: &mut Entity, cmd: &mut AdcCommand) -> bool {
        match cmd.command() {
            CMD_SUP => self.handle_sup(e, cmd),
            CMD_INF => self.handle_inf(e, cmd),
            CMD_TCP => self.handle_tcp(e, cmd),
            _ => self.handle_default(e, cmd),
        }
    }

    fn handle_default(&mut self, e: &mut Entity, cmd: &AdcCommand) -> bool {
        if e.state() != State::Normal {
            self.bad_state(e, cmd);
            return false;
        }
        true
    }

    fn handle_sup(&mut self, e: &mut Entity, cmd: &AdcCommand) -> bool {
        if !self.verify_sup(e, cmd) {
            return false;
        }
        if e.state() == State::Protocol {
            self.enter_identify(e, true);
        } else if e.state() != State::Normal {
            self.bad_state(e, cmd);
            return false;
        }
        true
    }

    /// Applies the AD/RM tokens and enforces the mandatory extensions.
    pub fn verify_sup(&mut self, e: &mut Entity, cmd: &AdcCommand) -> bool {
        e.update_supports(cmd);

        if !e.has_support(fourcc(b"BASE")) {
            self.disconnect_with(
                e,
                Reason::NoBaseSupport,
                StatusCode::ProtocolGeneric,
                "This hub requires BASE support",
                None,
                -1,
            );
            return false;
        }
        if !e.has_support(fourcc(b"TIGR")) {
            self.disconnect_with(
                e,
                Reason::NoTigrSupport,
                StatusCode::ProtocolGeneric,
                "This hub requires TIGR support",
                None,
                -1,
            );
            return false;
        }
        true
    }

    fn handle_inf(&mut self, e: &mut Entity, cmd: &mut AdcCommand) -> bool {
        if e.state() != State::Identify && e.state() != State::Normal {
            self.bad_state(e, cmd);
            return false;
        }

        if !self.verify_inf(e, cmd) {
            return false;
        }

        if e.state() == State::Identify {
            if !self.verify_overflow(e) {
                return false;
            }
            self.enter_normal(e, true, true);
            return false;
        }
        true
    }

    /// Runs all INF verifications and updates the entity's fields.
    pub fn verify_inf(&mut self, e: &mut Entity, cmd: &mut AdcCommand) -> bool {
        if !self.verify_cid(e, cmd) {
            return false;
        }
        if !self.verify_nick(e, cmd) {
            return false;
        }

        if let Some(de) = cmd.param("DE", 0)
            && !validate_charset(de, 32)
        {
            self.disconnect_with(
                e,
                Reason::InvalidDescription,
                StatusCode::ProtocolGeneric,
                "Invalid character in description",
                None,
                -1,
            );
            return false;
        }

        let is_client = e.entity_type() == EntityType::Client;
        if is_client && !self.verify_ip(e, cmd, false) {
            return false;
        }

        e.update_fields(cmd);

        if is_client
            && cmd.param("SU", 0).is_some()
            && !e.is_set(Flags::VALIDATE_HBRI)
            && e.state() != State::Hbri
        {
            self.strip_protocol_supports(e);
        }
        true
    }

    fn verify_cid(&mut self, e: &mut Entity, cmd: &mut AdcCommand) -> bool {
        if let Some(id) = cmd.param("ID", 0).map(str::to_string) {
            debug!(sid = %e.sid(), cid = %id, "verifying CID");

            if e.state() != State::Identify {
                // resending the unchanged CID is harmless
                match Cid::from_base32(&id) {
                    Some(cid) if cid == e.cid() => {
                        cmd.del_param("PD", 0);
                    }
                    _ => {
                        self.disconnect_with(
                            e,
                            Reason::CidChange,
                            StatusCode::ProtocolGeneric,
                            "CID changes not allowed",
                            None,
                            -1,
                        );
                        return false;
                    }
                }
            } else {
                if id.len() != Cid::BASE32_SIZE {
                    self.disconnect_with(
                        e,
                        Reason::PidCidLength,
                        StatusCode::ProtocolGeneric,
                        "Invalid CID length",
                        None,
                        -1,
                    );
                    return false;
                }
                let Some(cid) = Cid::from_base32(&id) else {
                    self.disconnect_with(
                        e,
                        Reason::PidCidLength,
                        StatusCode::ProtocolGeneric,
                        "Invalid CID encoding",
                        None,
                        -1,
                    );
                    return false;
                };

                let Some(pd) = cmd.param("PD", 0).map(str::to_string) else {
                    self.disconnect_with(
                        e,
                        Reason::PidMissing,
                        StatusCode::InfMissing,
                        "PID missing",
                        Some("FLPD".to_string()),
                        -1,
                    );
                    return false;
                };
                if pd.len() != Cid::BASE32_SIZE {
                    self.disconnect_with(
                        e,
                        Reason::PidCidLength,
                        StatusCode::ProtocolGeneric,
                        "Invalid PID length",
                        None,
                        -1,
                    );
                    return false;
                }
                let Some(pid) = Cid::from_base32(&pd) else {
                    self.disconnect_with(
                        e,
                        Reason::PidCidLength,
                        StatusCode::ProtocolGeneric,
                        "Invalid PID encoding",
                        None,
                        -1,
                    );
                    return false;
                };

                if Cid::from_pid(&pid) != cid {
                    self.disconnect_with(
                        e,
                        Reason::PidCidMismatch,
                        StatusCode::InvalidPid,
                        "PID does not correspond to CID",
                        None,
                        -1,
                    );
                    return false;
                }

                if let Some(&other_sid) = self.cids.get(&cid)
                    && other_sid != e.sid()
                {
                    // whoever held this CID is a ghost now
                    if let Some(mut other) = self.peers.remove(&other_sid) {
                        self.disconnect_with(
                            &mut other,
                            Reason::CidTaken,
                            StatusCode::CidTaken,
                            "CID taken",
                            None,
                            -1,
                        );
                        self.remove_entity(&mut other, Reason::CidTaken, "");
                    }
                }

                e.set_cid(cid);
                self.cids.insert(cid, e.sid());
                cmd.del_param("PD", 0);
            }
        }

        if cmd.param("PD", 0).is_some() {
            self.disconnect_with(
                e,
                Reason::PidWithoutCid,
                StatusCode::ProtocolGeneric,
                "CID required when sending PID",
                None,
                -1,
            );
            return false;
        }
        true
    }

    fn verify_nick(&mut self, e: &mut Entity, cmd: &AdcCommand) -> bool {
        if let Some(nick) = cmd.param("NI", 0).map(str::to_string) {
            debug!(sid = %e.sid(), nick, "verifying nick");

            if !validate_nick(&nick) {
                self.disconnect_with(
                    e,
                    Reason::NickInvalid,
                    StatusCode::NickInvalid,
                    "Invalid character in nick",
                    None,
                    -1,
                );
                return false;
            }

            let old = e.field("NI");
            if !old.is_empty() && self.nicks.get(old) == Some(&e.sid()) {
                self.nicks.remove(old);
            }

            if self.nicks.contains_key(&nick) {
                self.disconnect_with(
                    e,
                    Reason::NickTaken,
                    StatusCode::NickTaken,
                    "Nick taken, please pick another one",
                    None,
                    -1,
                );
                return false;
            }
            self.nicks.insert(nick, e.sid());
        }
        true
    }

    /// Validates the INF addresses against the peer. On the happy path this
    /// may flag the entity for (or immediately start) HBRI validation.
    pub(crate) fn verify_ip(&mut self, e: &mut Entity, cmd: &mut AdcCommand, is_hbri_conn: bool) -> bool {
        if e.is_set(Flags::OK_IP) {
            return true;
        }
        let Some(ip) = e.ip() else {
            return true;
        };
        debug!(sid = %e.sid(), %ip, "verifying IP");

        let v6 = e.is_v6();
        let remote = match ip {
            IpAddr::V6(a) if !v6 => a
                .to_ipv4_mapped()
                .map_or(ip, IpAddr::V4),
            _ => ip,
        };

        match validate_ip_fields(cmd, remote, v6) {
            Err(error) => {
                self.disconnect_with(
                    e,
                    Reason::InvalidIp,
                    StatusCode::BAD_IP,
                    &error,
                    Some(format!("IP{ip}")),
                    -1,
                );
                false
            }
            Ok(validate_secondary) => {
                if !is_hbri_conn && validate_secondary {
                    if e.state() == State::Normal {
                        // connected user advertising new params; revalidate
                        self.send_hbri(e);
                    } else {
                        // still logging in; validation runs at NORMAL entry
                        e.set_flag(Flags::VALIDATE_HBRI);
                    }
                }
                true
            }
        }
    }

    /// Rejects the login when too many connections sit in overflow, which
    /// means the hub is out of upstream bandwidth.
    pub fn verify_overflow(&mut self, e: &mut Entity) -> bool {
        let (total, overflowing) = self
            .roster()
            .fold((0usize, 0usize), |(total, over), p| {
                (total + 1, over + usize::from(p.overflow().is_some()))
            });

        if overflowing > 3 && overflowing > total / 4 {
            self.disconnect_with(
                e,
                Reason::NoBandwidth,
                StatusCode::HubFull,
                "Not enough bandwidth available, please try again later",
                None,
                1,
            );
            return false;
        }
        true
    }

    /// Drops the TCP/UDP support tokens for the family the client is
    /// already connected over.
    pub(crate) fn strip_protocol_supports(&mut self, e: &mut Entity) {
        let v = if e.is_v6() { b'4' } else { b'6' };
        e.remove_filter(fourcc(&[b'T', b'C', b'P', v]));
        e.remove_filter(fourcc(&[b'U', b'D', b'P', v]));
    }

    /// Issues an HBRI validation request over the primary connection:
    /// allocates a token, advertises the hub's opposite-family address, and
    /// parks the entity in HBRI state if it is still logging in.
    pub(crate) fn send_hbri(&mut self, e: &mut Entity) -> bool {
        if !e.has_support(fourcc(b"HBRI")) {
            return false;
        }
        let Some(socket) = e.socket() else {
            return false;
        };

        let mut cmd = AdcCommand::new(CMD_TCP);
        if !socket.hbri_params(&mut cmd) {
            return false;
        }

        e.set_flag(Flags::VALIDATE_HBRI);
        if e.state() != State::Normal {
            e.set_state(State::Hbri);
        }

        let token = rand::rng().random::<u32>().to_string();
        self.hbri_tokens.insert(
            token.clone(),
            HbriToken {
                sid: e.sid(),
                issued: std::time::Instant::now(),
            },
        );
        debug!(sid = %e.sid(), token, "HBRI: requesting validation");

        cmd.push_param("TO", &token);
        e.send(&cmd);
        true
    }

    /// Abandons HBRI validation: the entity falls back to single-protocol
    /// operation and, if its login was parked, finishes entering NORMAL.
    pub(crate) fn fail_hbri(&mut self, e: &mut Entity) {
        e.unset_flag(Flags::VALIDATE_HBRI);
        self.strip_protocol_supports(e);
        if e.state() == State::Hbri {
            self.enter_normal(e, true, true);
        }
    }

    /// The HBRI completion command, arriving over the secondary connection.
    fn handle_tcp(&mut self, e: &mut Entity, cmd: &mut AdcCommand) -> bool {
        if e.entity_type() != EntityType::Client {
            return false;
        }
        debug!(sid = %e.sid(), %cmd, "received HBRI TCP");

        let Some(token) = cmd.param("TO", 0).map(str::to_string) else {
            return self.hbri_error(e, "Validation token missing");
        };

        let primary_sid = match self.hbri_tokens.get(&token) {
            Some(t) => t.sid,
            None => {
                debug!(token, "HBRI TCP: unknown validation token");
                return self.hbri_error(e, "Unknown validation token");
            }
        };
        if primary_sid == e.sid() {
            // redeemed over the issuing connection itself
            self.bad_state(e, cmd);
            return false;
        }
        let Some(mut primary) = self.peers.remove(&primary_sid) else {
            self.hbri_tokens.remove(&token);
            return self.hbri_error(e, "Unknown validation token");
        };

        primary.unset_flag(Flags::VALIDATE_HBRI);

        if primary.state() != State::Hbri && primary.state() != State::Normal {
            self.peers.insert(primary_sid, primary);
            self.bad_state(e, cmd);
            return false;
        }

        self.hbri_tokens.remove(&token);

        if primary.is_v6() == e.is_v6() {
            let msg = "Validation request was received over the wrong IP protocol";
            e.send(&sta(Severity::Recoverable, StatusCode::HbriTimeout, msg));
            self.fail_hbri(&mut primary);
            self.reinsert(primary_sid, primary);
            e.disconnect(Reason::InvalidIp, msg);
            return false;
        }

        if !self.verify_ip(e, cmd, true) {
            self.fail_hbri(&mut primary);
            self.reinsert(primary_sid, primary);
            return false;
        }

        // the validation connection has served its purpose
        e.send(&sta(Severity::Success, StatusCode::Success, "Validation succeed"));
        e.disconnect(Reason::Hbri, "");

        // keep only SU plus the secondary-family address and port
        let (ip_param, port_param) = if e.is_v6() { ("I6", "U6") } else { ("I4", "U4") };
        cmd.params_mut().retain(|p| {
            p.len() >= 2
                && (p.starts_with("SU") || p.starts_with(ip_param) || p.starts_with(port_param))
        });

        primary.update_fields(cmd);

        if primary.state() == State::Hbri {
            // continue with the parked login
            self.enter_normal(&mut primary, true, true);
        } else {
            // already online; publish the updated fields
            let mut inf =
                AdcCommand::with_type(CMD_INF, MsgType::Broadcast, primary.sid());
            *inf.params_mut() = cmd.params().to_vec();
            let buf = inf.to_bytes();
            self.send_to_all(&buf);
            primary.send_buffer(&buf, false);
        }
        self.reinsert(primary_sid, primary);
        true
    }

    fn reinsert(&mut self, sid: Sid, e: Entity) {
        if !e.is_set(Flags::GHOST) {
            self.peers.insert(sid, e);
        }
    }

    fn hbri_error(&mut self, e: &mut Entity, msg: &str) -> bool {
        e.send(&sta(Severity::Fatal, StatusCode::LoginGeneric, msg));
        e.disconnect(Reason::Hbri, msg);
        true
    }
}

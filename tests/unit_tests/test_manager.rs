// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, Mutex};

use adc_hub_rs::{
    cfg::config::HubConfig,
    hub::ClientManager,
    reason::Reason,
    wire::{
        cid::Cid,
        tag::{Sid, to_base32},
    },
};
use bytes::Bytes;
use tiger::{Digest, Tiger};

use super::{make_handle, recorder};

fn manager() -> ClientManager {
    ClientManager::new(Arc::new(HubConfig::default()), make_handle())
}

/// Registers a bot with a nick and a derived CID; returns its sid and the
/// lines it received.
fn add_bot(cm: &mut ClientManager, nick: &str, seed: u8) -> (Sid, Arc<Mutex<Vec<String>>>) {
    let (handler, lines) = recorder();
    let sid = cm.create_bot(handler);
    let e = cm.peer_mut(sid).expect("bot exists");
    e.set_field("NI", nick);
    e.set_cid(Cid::from_pid(&Cid::new([seed; 24])));
    cm.reg_bot(sid);
    (sid, lines)
}

fn lines_of(lines: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    lines.lock().expect("lines lock").clone()
}

fn inject(cm: &mut ClientManager, sid: Sid, line: &str) {
    cm.on_line(sid, Bytes::from(line.to_string()));
}

#[test]
fn test_bot_registration_populates_maps() {
    let mut cm = manager();
    let (a, a_lines) = add_bot(&mut cm, "alpha", 1);
    let (b, _) = add_bot(&mut cm, "beta", 2);

    assert_eq!(cm.roster_len(), 2);
    assert_eq!(cm.sid_by_nick("alpha"), Some(a));
    assert_eq!(cm.sid_by_nick("beta"), Some(b));
    assert_eq!(cm.sid_by_cid(&Cid::from_pid(&Cid::new([2; 24]))), Some(b));

    // alpha observed beta's INF broadcast
    let received = lines_of(&a_lines);
    assert!(
        received
            .iter()
            .any(|l| l.starts_with(&format!("BINF {b} ")) && l.contains("NIbeta")),
        "alpha should have seen beta's INF: {received:?}"
    );
}

#[test]
fn test_sid_allocation_unique_and_valid() {
    let mut cm = manager();
    let mut seen = std::collections::HashSet::new();
    for i in 0..50u8 {
        let (sid, _) = add_bot(&mut cm, &format!("bot{i}"), i);
        assert!(!sid.is_invalid());
        assert!(!sid.is_hub());
        assert!(seen.insert(sid), "duplicate sid allocated");
    }
}

#[test]
fn test_broadcast_reaches_everyone_including_sender() {
    let mut cm = manager();
    let (a, a_lines) = add_bot(&mut cm, "alpha", 1);
    let (_b, b_lines) = add_bot(&mut cm, "beta", 2);

    inject(&mut cm, a, &format!("BMSG {a} hello"));

    for lines in [&a_lines, &b_lines] {
        assert!(
            lines_of(lines)
                .iter()
                .any(|l| l == &format!("BMSG {a} hello")),
            "broadcast missing"
        );
    }
}

#[test]
fn test_direct_goes_to_target_only() {
    let mut cm = manager();
    let (a, a_lines) = add_bot(&mut cm, "alpha", 1);
    let (b, b_lines) = add_bot(&mut cm, "beta", 2);

    inject(&mut cm, a, &format!("DMSG {a} {b} hello"));

    let to_b = lines_of(&b_lines);
    assert_eq!(
        to_b.iter().filter(|l| l.contains("DMSG")).count(),
        1,
        "target should get exactly one copy"
    );
    assert!(
        !lines_of(&a_lines).iter().any(|l| l.contains("DMSG")),
        "sender must not get a direct copy"
    );
}

#[test]
fn test_echo_goes_to_both_sides() {
    let mut cm = manager();
    let (a, a_lines) = add_bot(&mut cm, "alpha", 1);
    let (b, b_lines) = add_bot(&mut cm, "beta", 2);

    inject(&mut cm, a, &format!("EMSG {a} {b} hi"));

    for lines in [&a_lines, &b_lines] {
        assert_eq!(
            lines_of(lines).iter().filter(|l| l.contains("EMSG")).count(),
            1
        );
    }
}

#[test]
fn test_feature_cast_respects_filters() {
    let mut cm = manager();
    let (a, a_lines) = add_bot(&mut cm, "alpha", 1);
    let (_b, b_lines) = add_bot(&mut cm, "beta", 2);

    cm.peer_mut(a)
        .expect("alpha exists")
        .set_field("SU", "TCP4,UDP4");

    inject(&mut cm, a, &format!("FSCH {a} +TCP4 ANx"));

    assert!(
        lines_of(&a_lines).iter().any(|l| l.contains("FSCH")),
        "advertising entity should receive the cast"
    );
    assert!(
        !lines_of(&b_lines).iter().any(|l| l.contains("FSCH")),
        "entity without filters must not receive feature casts"
    );
}

#[test]
fn test_pre_send_hook_can_veto_one_delivery() {
    let mut cm = manager();
    let (a, _) = add_bot(&mut cm, "alpha", 1);
    let (b, b_lines) = add_bot(&mut cm, "beta", 2);

    let sub = cm.signals.send.connect(Box::new(move |e, _cmd, ok| {
        if e.sid() == b {
            *ok = false;
        }
    }));

    inject(&mut cm, a, &format!("BMSG {a} first"));
    assert!(!lines_of(&b_lines).iter().any(|l| l.contains("first")));

    cm.signals.send.disconnect(sub);
    inject(&mut cm, a, &format!("BMSG {a} second"));
    assert!(lines_of(&b_lines).iter().any(|l| l.contains("second")));
}

#[test]
fn test_nick_taken_in_normal_inf() {
    let mut cm = manager();
    let (a, _) = add_bot(&mut cm, "dup", 1);
    let (b, b_lines) = add_bot(&mut cm, "beta", 2);

    inject(&mut cm, b, &format!("BINF {b} NIdup"));

    let received = lines_of(&b_lines);
    assert!(
        received.iter().any(|l| l.starts_with("ISTA 222 ")),
        "expected a fatal nick-taken STA: {received:?}"
    );
    assert!(
        received
            .iter()
            .any(|l| l.starts_with(&format!("IQUI {b} DI1"))),
        "expected the closing QUI: {received:?}"
    );
    // the original holder keeps the nick
    assert_eq!(cm.sid_by_nick("dup"), Some(a));
}

#[test]
fn test_invalid_nick_is_rejected() {
    let mut cm = manager();
    let (b, b_lines) = add_bot(&mut cm, "beta", 2);

    inject(&mut cm, b, &format!("BINF {b} NIbad\\sname"));
    assert!(
        lines_of(&b_lines).iter().any(|l| l.starts_with("ISTA 221 ")),
        "space in nick must be rejected"
    );

    let mut cm = manager();
    let (b, b_lines) = add_bot(&mut cm, "beta", 2);
    inject(&mut cm, b, &format!("BINF {b} NIok\u{2100}"));
    assert!(
        !lines_of(&b_lines).iter().any(|l| l.starts_with("ISTA 221")),
        "letter-like symbols are allowed"
    );

    let mut cm = manager();
    let (b, b_lines) = add_bot(&mut cm, "beta", 2);
    inject(&mut cm, b, &format!("BINF {b} NIbad\u{ad}hyphen"));
    assert!(
        lines_of(&b_lines).iter().any(|l| l.starts_with("ISTA 221 ")),
        "soft hyphen must be rejected"
    );
}

#[test]
fn test_info_type_from_peer_is_rejected() {
    let mut cm = manager();
    let (b, b_lines) = add_bot(&mut cm, "beta", 2);

    inject(&mut cm, b, "ISTA 000 sneaky");

    let received = lines_of(&b_lines);
    assert!(
        received.iter().any(|l| l.starts_with("ISTA 240 ")),
        "I-typed commands from peers must be fatal: {received:?}"
    );
}

#[test]
fn test_spoofed_source_sid_is_rejected() {
    let mut cm = manager();
    let (a, _) = add_bot(&mut cm, "alpha", 1);
    let (b, b_lines) = add_bot(&mut cm, "beta", 2);

    inject(&mut cm, b, &format!("BMSG {a} forged"));

    assert!(
        lines_of(&b_lines).iter().any(|l| l.starts_with("ISTA 240 ")),
        "forged from-SID must be fatal"
    );
}

#[test]
fn test_removal_broadcasts_qui_and_cleans_maps() {
    let mut cm = manager();
    let (a, a_lines) = add_bot(&mut cm, "alpha", 1);
    let (b, _) = add_bot(&mut cm, "beta", 2);

    cm.on_failed(b, Reason::SocketError, "gone");

    assert_eq!(cm.roster_len(), 1);
    assert_eq!(cm.sid_by_nick("beta"), None);
    assert_eq!(cm.sid_by_cid(&Cid::from_pid(&Cid::new([2; 24]))), None);
    assert_eq!(cm.sid_by_nick("alpha"), Some(a));

    assert!(
        lines_of(&a_lines)
            .iter()
            .any(|l| l == &format!("IQUI {b} DI1")),
        "remaining entities must see the leave"
    );

    // removing twice is a no-op
    cm.on_failed(b, Reason::SocketError, "gone again");
    assert_eq!(cm.roster_len(), 1);
}

#[test]
fn test_get_entity_only_sees_roster_and_hub() {
    let mut cm = manager();
    assert!(cm.get_entity(Sid::HUB).is_some());

    let (handler, _) = recorder();
    let pending = cm.create_bot(handler);
    assert!(cm.get_entity(pending).is_none(), "IDENTIFY entities are not addressable");
    assert!(cm.peer_mut(pending).is_some());

    cm.reg_bot(pending);
    assert!(cm.get_entity(pending).is_some());
}

#[test]
fn test_verify_password() {
    let cm = manager();
    let salt = vec![7u8; 32];

    let mut tiger = Tiger::new();
    tiger.update(b"secret");
    tiger.update(&salt);
    let supplied = to_base32(&tiger.finalize());

    assert!(cm.verify_password("secret", &salt, &supplied));
    assert!(!cm.verify_password("wrong", &salt, &supplied));
    assert!(!cm.verify_password("secret", &[0u8; 32], &supplied));
    assert!(!cm.verify_password("secret", &salt, "notbase32!!"));
}

#[test]
fn test_hub_prepare_supports() {
    let mut cm = manager();
    cm.prepare_supports(true);
    let sup = cm.hub_entity_mut().get_sup();
    let line = String::from_utf8_lossy(&sup).into_owned();
    assert!(line.starts_with("ISUP "));
    assert!(line.contains("ADBASE"));
    assert!(line.contains("ADTIGR"));
    assert!(line.contains("ADHBRI"));
}

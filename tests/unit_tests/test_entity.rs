// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use adc_hub_rs::{
    entity::{Entity, Flags},
    wire::{
        command::AdcCommand,
        tag::{Sid, fourcc},
    },
};

use super::{make_handle, recorder};

fn bot(seed: &[u8; 4]) -> Entity {
    let (handler, _) = recorder();
    Entity::new_bot(Sid::from_wire(seed).expect("sid"), handler, make_handle())
}

#[test]
fn test_su_field_derives_filters() {
    let mut e = bot(b"BCDE");
    e.set_field("SU", "TCP4,UDP4");
    assert!(e.has_filter(fourcc(b"TCP4")));
    assert!(e.has_filter(fourcc(b"UDP4")));
    assert!(!e.has_filter(fourcc(b"TCP6")));
    assert_eq!(e.field("SU"), "TCP4,UDP4");

    // a value of the wrong shape clears the filters but keeps the field
    e.set_field("SU", "TCP4,X");
    assert!(!e.has_filter(fourcc(b"TCP4")));
    assert_eq!(e.field("SU"), "TCP4,X");

    e.set_field("SU", "");
    assert!(!e.has_field("SU"));
}

#[test]
fn test_is_filtered() {
    let mut e = bot(b"BCDE");

    // no advertised filters means no feature casts at all
    assert!(e.is_filtered("+TCP4"));

    e.set_field("SU", "TCP4,UDP4");
    assert!(!e.is_filtered("+TCP4"));
    assert!(!e.is_filtered("+TCP4+UDP4"));
    assert!(e.is_filtered("+TCP6"));
    assert!(e.is_filtered("-TCP4"));
    assert!(!e.is_filtered("-NAT0"));
    assert!(e.is_filtered("+UDP4-TCP4"));
}

#[test]
fn test_client_type_flags_rewrite_ct() {
    let mut e = bot(b"BCDE");
    // BOT was set by the constructor
    assert_eq!(e.field("CT"), "1");

    e.set_flag(Flags::OP);
    assert_eq!(e.field("CT"), "5");
    e.unset_flag(Flags::OP);
    assert_eq!(e.field("CT"), "1");

    // non-type flags leave CT alone
    e.set_flag(Flags::PASSWORD);
    assert_eq!(e.field("CT"), "1");
}

#[test]
fn test_inf_cache_invalidation() {
    let mut e = bot(b"BCDE");
    e.set_field("NI", "bot");
    let first = e.get_inf();
    assert_eq!(e.get_inf(), first);

    let line = String::from_utf8_lossy(&first).into_owned();
    assert!(line.starts_with("BINF BCDE "));
    assert!(line.contains("NIbot"));

    e.set_field("NI", "renamed");
    let second = e.get_inf();
    assert_ne!(second, first);
    assert!(String::from_utf8_lossy(&second).contains("NIrenamed"));
}

#[test]
fn test_hub_inf_is_info_typed() {
    let mut hub = Entity::new_hub(make_handle());
    hub.set_field("NI", "hub");
    let inf = hub.get_inf();
    let line = String::from_utf8_lossy(&inf).into_owned();
    assert!(line.starts_with("IINF "));
    assert!(line.contains("CT32"));
}

#[test]
fn test_supports_roundtrip_leaves_sup_identical() {
    let mut e = bot(b"BCDE");
    e.add_supports(fourcc(b"BASE"));
    e.add_supports(fourcc(b"TIGR"));
    let before = e.get_sup();

    assert!(e.add_supports(fourcc(b"BLO0")));
    assert!(!e.add_supports(fourcc(b"BLO0")));
    assert!(e.remove_supports(fourcc(b"BLO0")));
    assert!(!e.remove_supports(fourcc(b"BLO0")));

    assert_eq!(e.get_sup(), before);
}

#[test]
fn test_update_supports_from_command() {
    let mut e = bot(b"BCDE");
    let cmd = AdcCommand::parse(b"HSUP ADBASE ADTIGR ADHBRI RMHBRI junk").expect("parse");
    e.update_supports(&cmd);
    assert!(e.has_support(fourcc(b"BASE")));
    assert!(e.has_support(fourcc(b"TIGR")));
    assert!(!e.has_support(fourcc(b"HBRI")));
}

#[test]
fn test_update_fields_skips_pd() {
    let mut e = bot(b"BCDE");
    let cmd = AdcCommand::parse(b"BINF BCDE NInick PDSECRET DEdesc").expect("parse");
    e.update_fields(&cmd);
    assert_eq!(e.field("NI"), "nick");
    assert_eq!(e.field("DE"), "desc");
    assert!(!e.has_field("PD"));
    assert!(!String::from_utf8_lossy(&e.get_inf()).contains("SECRET"));
}

#[test]
fn test_remove_filter_rewrites_su() {
    let mut e = bot(b"BCDE");
    e.set_field("SU", "TCP4,UDP4,TCP6");
    assert!(e.remove_filter(fourcc(b"UDP4")));
    assert_eq!(e.field("SU"), "TCP4,TCP6");
    assert!(!e.has_filter(fourcc(b"UDP4")));

    assert!(e.remove_filter(fourcc(b"TCP4")));
    assert!(e.remove_filter(fourcc(b"TCP6")));
    assert!(!e.has_field("SU"));

    assert!(!e.remove_filter(fourcc(b"TCP4")));
}

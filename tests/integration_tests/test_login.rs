// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use serial_test::serial;

use super::common::{TestClient, spawn_hub, test_config};

#[tokio::test]
#[serial]
async fn test_login_happy_path() -> Result<()> {
    let (hub, addr) = spawn_hub(test_config()).await?;

    let mut client = TestClient::connect(addr).await?;
    client.send("HSUP ADBASE ADTIGR").await?;

    let isup = client.recv().await?;
    assert!(isup.contains("ADBASE"), "{isup:?}");
    assert!(isup.contains("ADTIGR"), "{isup:?}");

    let isid = client.recv().await?;
    assert!(isid.starts_with("ISID "), "{isid:?}");
    client.sid = isid[5..9].to_string();

    let iinf = client.recv().await?;
    assert!(iinf.starts_with("IINF "), "{iinf:?}");
    assert!(iinf.contains("CT32"), "{iinf:?}");
    assert!(iinf.contains("NItesthub"), "{iinf:?}");

    let (pid, cid) = TestClient::pid_cid(1);
    client
        .send(&format!(
            "BINF {} ID{} PD{} NIalice",
            client.sid, cid, pid
        ))
        .await?;

    let own = client.recv().await?;
    assert!(own.starts_with(&format!("BINF {} ", client.sid)), "{own:?}");
    assert!(own.contains(&format!("ID{cid}")), "{own:?}");
    assert!(own.contains("NIalice"), "{own:?}");
    assert!(own.contains("I4127.0.0.1"), "{own:?}");
    assert!(!own.contains(" PD"), "the PID must never be propagated: {own:?}");

    hub.shutdown();
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_second_client_sees_roster() -> Result<()> {
    let (hub, addr) = spawn_hub(test_config()).await?;

    let mut alice = TestClient::connect(addr).await?;
    alice.login("alice", 1).await?;

    let mut bob = TestClient::connect(addr).await?;
    bob.handshake().await?;
    let (pid, cid) = TestClient::pid_cid(2);
    bob.send(&format!("BINF {} ID{} PD{} NIbob", bob.sid, cid, pid))
        .await?;

    // bob gets alice's INF before his own
    let first = bob.recv().await?;
    assert!(
        first.starts_with(&format!("BINF {} ", alice.sid)) && first.contains("NIalice"),
        "expected the roster INF first, got {first:?}"
    );
    let own = bob.recv().await?;
    assert!(own.starts_with(&format!("BINF {} ", bob.sid)), "{own:?}");

    // alice sees bob join
    let joined = alice.recv_until("BINF ").await?;
    assert!(joined.contains("NIbob"), "{joined:?}");

    hub.shutdown();
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_nick_taken() -> Result<()> {
    let (hub, addr) = spawn_hub(test_config()).await?;

    let mut alice = TestClient::connect(addr).await?;
    alice.login("dup", 1).await?;

    let mut bob = TestClient::connect(addr).await?;
    bob.handshake().await?;
    let (pid, cid) = TestClient::pid_cid(2);
    bob.send(&format!("BINF {} ID{} PD{} NIdup", bob.sid, cid, pid))
        .await?;

    let sta = bob.recv().await?;
    assert!(sta.starts_with("ISTA 222 "), "{sta:?}");
    let qui = bob.recv().await?;
    assert!(qui.starts_with(&format!("IQUI {} DI1", bob.sid)), "{qui:?}");
    bob.expect_closed().await?;

    hub.shutdown();
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_pid_cid_mismatch_is_fatal() -> Result<()> {
    let (hub, addr) = spawn_hub(test_config()).await?;

    let mut client = TestClient::connect(addr).await?;
    client.handshake().await?;
    let (pid, _) = TestClient::pid_cid(1);
    let (_, wrong_cid) = TestClient::pid_cid(2);
    client
        .send(&format!(
            "BINF {} ID{} PD{} NIeve",
            client.sid, wrong_cid, pid
        ))
        .await?;

    let sta = client.recv().await?;
    assert!(sta.starts_with("ISTA 227 "), "{sta:?}");
    client.expect_closed().await?;

    hub.shutdown();
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_inf_before_sup_is_bad_state() -> Result<()> {
    let (hub, addr) = spawn_hub(test_config()).await?;

    let mut client = TestClient::connect(addr).await?;
    client.send("HINF NIeager").await?;

    let sta = client.recv().await?;
    assert!(sta.starts_with("ISTA 242 "), "{sta:?}");
    assert!(sta.contains("FCHINF"), "{sta:?}");
    let qui = client.recv().await?;
    assert!(qui.starts_with("IQUI "), "{qui:?}");
    client.expect_closed().await?;

    hub.shutdown();
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_missing_base_support() -> Result<()> {
    let (hub, addr) = spawn_hub(test_config()).await?;

    let mut client = TestClient::connect(addr).await?;
    client.send("HSUP ADTIGR").await?;

    let sta = client.recv().await?;
    assert!(sta.starts_with("ISTA 240 "), "{sta:?}");
    assert!(sta.contains("BASE"), "{sta:?}");
    client.expect_closed().await?;

    hub.shutdown();
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_command_size_limit() -> Result<()> {
    let mut cfg = test_config();
    cfg.max_command_size = 128;
    let (hub, addr) = spawn_hub(cfg).await?;

    // a line of exactly the limit (newline included) is fine
    let mut polite = TestClient::connect(addr).await?;
    let mut line = String::from("HSUP ADBASE ADTIGR ");
    while line.len() < 127 {
        line.push('x');
    }
    polite.send(&line).await?;
    let isup = polite.recv().await?;
    assert!(isup.starts_with("ISUP "), "{isup:?}");

    // one more byte is not
    let mut rude = TestClient::connect(addr).await?;
    rude.send_raw(&vec![b'A'; 300]).await?;
    let sta = rude.recv().await?;
    assert!(sta.starts_with("ISTA 240 "), "{sta:?}");
    rude.expect_closed().await?;

    hub.shutdown();
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_empty_line_is_keepalive() -> Result<()> {
    let (hub, addr) = spawn_hub(test_config()).await?;

    let mut client = TestClient::connect(addr).await?;
    client.send("").await?;
    client.login("alive", 1).await?;

    hub.shutdown();
    Ok(())
}

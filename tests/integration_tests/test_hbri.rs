// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use adc_hub_rs::cfg::config::ServerInfo;
use anyhow::{Context, Result};
use serial_test::serial;

use super::common::{TestClient, spawn_hub, test_config};

fn hbri_config(bind_v6: bool) -> adc_hub_rs::cfg::config::HubConfig {
    let mut cfg = test_config();
    cfg.servers.clear();
    cfg.servers.push(Arc::new(ServerInfo {
        port: 0,
        bind4: Some("127.0.0.1".parse().expect("loopback4")),
        bind6: bind_v6.then(|| "::1".parse().expect("loopback6")),
        address4: Some("127.0.0.1".to_string()),
        address6: Some("::1".to_string()),
        ..ServerInfo::default()
    }));
    cfg
}

fn token_of(itcp: &str) -> Option<String> {
    itcp.split(' ')
        .find(|p| p.starts_with("TO"))
        .map(|p| p[2..].to_string())
}

/// A v4 client advertising a v6 address gets an HBRI request; when no
/// secondary connection shows up the hub times the token out with a
/// recoverable STA and completes the login single-protocol.
#[tokio::test]
#[serial]
async fn test_hbri_timeout_falls_back() -> Result<()> {
    let mut cfg = hbri_config(false);
    cfg.hbri_timeout = Duration::from_millis(200);
    let (hub, addr) = spawn_hub(cfg).await?;

    let mut client = TestClient::connect(addr).await?;
    client.handshake_with("HSUP ADBASE ADTIGR ADHBRI").await?;
    let (pid, cid) = TestClient::pid_cid(1);
    client
        .send(&format!(
            "BINF {} ID{} PD{} NIalice I62001:db8::1",
            client.sid, cid, pid
        ))
        .await?;

    let itcp = client.recv_until("ITCP ").await?;
    assert!(itcp.contains("I6::1"), "{itcp:?}");
    assert!(itcp.contains("P6"), "{itcp:?}");
    assert!(token_of(&itcp).is_some(), "{itcp:?}");

    // expiry runs on the next housekeeping tick
    let sta = client.recv_until("ISTA ").await?;
    assert!(sta.starts_with("ISTA 145 "), "{sta:?}");
    assert!(sta.contains("IPv6"), "{sta:?}");

    // the login still completes, on v4 only
    let own = client
        .recv_until(&format!("BINF {} ", client.sid))
        .await?;
    assert!(own.contains("NIalice"), "{own:?}");

    hub.shutdown();
    Ok(())
}

/// Full HBRI round: the secondary v6 connection redeems the token, gets a
/// success STA, and the primary's INF gains the validated v6 address.
#[tokio::test]
#[serial]
async fn test_hbri_secondary_validation() -> Result<()> {
    // skip quietly on hosts without a usable IPv6 loopback
    if tokio::net::TcpListener::bind("[::1]:0").await.is_err() {
        eprintln!("skipping: IPv6 loopback unavailable");
        return Ok(());
    }

    let (hub, addr4) = spawn_hub(hbri_config(true)).await?;
    let addr6 = hub
        .local_addrs()
        .iter()
        .find(|a| a.is_ipv6())
        .copied()
        .context("no v6 listener")?;

    let mut primary = TestClient::connect(addr4).await?;
    primary.handshake_with("HSUP ADBASE ADTIGR ADHBRI").await?;
    let (pid, cid) = TestClient::pid_cid(1);
    primary
        .send(&format!(
            "BINF {} ID{} PD{} NIalice I6::1",
            primary.sid, cid, pid
        ))
        .await?;

    let itcp = primary.recv_until("ITCP ").await?;
    let token = token_of(&itcp).context("no TO token in ITCP")?;

    let mut secondary = TestClient::connect(addr6).await?;
    secondary.handshake().await?;
    secondary
        .send(&format!("HTCP TO{token} I6::1"))
        .await?;

    let sta = secondary.recv_until("ISTA ").await?;
    assert!(sta.starts_with("ISTA 000 "), "{sta:?}");
    secondary.expect_closed().await?;

    // the primary finishes its login with the validated v6 address
    let own = primary
        .recv_until(&format!("BINF {} ", primary.sid))
        .await?;
    assert!(own.contains("NIalice"), "{own:?}");
    assert!(own.contains("I6::1"), "{own:?}");
    assert!(own.contains("I4127.0.0.1"), "{own:?}");

    hub.shutdown();
    Ok(())
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A single hub instance: the serialized job queue that every handler runs
//! on, the recurring timers, and the listening sockets.
//!
//! All roster state lives inside one task; I/O completions and timers post
//! closures to it over a FIFO channel, so handlers run to completion without
//! any locking around the roster.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    cfg::config::{HubConfig, ServerInfo},
    hub::ClientManager,
    socket::{ManagedSocket, SocketOptions},
};

/// A unit of work executed on the core task.
pub type Job = Box<dyn FnOnce(&mut ClientManager) + Send>;

/// Posts work to the core task; cheap to clone and safe to use from any
/// task.
#[derive(Clone)]
pub struct CoreHandle {
    jobs: mpsc::UnboundedSender<Job>,
    cancel: CancellationToken,
}

impl CoreHandle {
    /// Runs `f` on the core task, after everything already queued.
    pub fn post(&self, f: impl FnOnce(&mut ClientManager) + Send + 'static) {
        let _ = self.jobs.send(Box::new(f));
    }

    /// Runs `f` on the core task after a delay.
    pub fn post_after(&self, delay: Duration, f: impl FnOnce(&mut ClientManager) + Send + 'static) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = this.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => this.post(f),
            }
        });
    }

    /// Runs `f` on the core task at a fixed interval. The returned closure
    /// cancels the timer; a tick already dispatched may still run once.
    pub fn add_timed_job<T: FnMut(&mut ClientManager) + Send + 'static>(
        &self,
        every: Duration,
        f: T,
    ) -> impl FnOnce() + Send + use<T> {
        let token = self.cancel.child_token();
        let canceller = token.clone();
        let this = self.clone();
        tokio::spawn(async move {
            let slot = Arc::new(StdMutex::new(f));
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await; // the zeroth tick fires immediately
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let slot = Arc::clone(&slot);
                        this.post(move |cm| {
                            if let Ok(mut f) = slot.lock() {
                                f(cm);
                            }
                        });
                    }
                }
            }
        });
        move || canceller.cancel()
    }

    /// Requests shutdown of the whole hub instance.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn cancelled_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// One hub instance, constructed from its settings and run to completion.
pub struct Core {
    cfg: Arc<HubConfig>,
    jobs_tx: mpsc::UnboundedSender<Job>,
    jobs_rx: mpsc::UnboundedReceiver<Job>,
    cancel: CancellationToken,
}

/// A started hub: the dispatch task plus the addresses it listens on.
pub struct RunningCore {
    handle: CoreHandle,
    local_addrs: Vec<SocketAddr>,
    task: JoinHandle<()>,
}

impl RunningCore {
    pub fn handle(&self) -> &CoreHandle {
        &self.handle
    }

    /// The actually-bound listener addresses (useful with port 0).
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn shutdown(&self) {
        self.handle.shutdown();
    }

    /// Waits for the dispatch task to finish (after `shutdown`).
    pub async fn wait(self) -> Result<()> {
        self.task.await.context("core dispatch task panicked")?;
        Ok(())
    }
}

impl Core {
    pub fn new(cfg: HubConfig) -> Core {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        Core {
            cfg: Arc::new(cfg),
            jobs_tx,
            jobs_rx,
            cancel: CancellationToken::new(),
        }
    }

    pub fn handle(&self) -> CoreHandle {
        CoreHandle {
            jobs: self.jobs_tx.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Binds the listeners, spawns the acceptors and timers, and starts the
    /// dispatch loop.
    pub async fn start(mut self) -> Result<RunningCore> {
        let handle = self.handle();
        let opts = Arc::new(self.cfg.socket_options());

        let mut local_addrs = Vec::new();
        for server in &self.cfg.servers {
            if server.secure() {
                error!(
                    port = server.port,
                    "TLS termination is not built in; terminate TLS in front of the hub. \
                     Skipping this listener"
                );
                continue;
            }
            for bind in server.bind_addrs() {
                let listener = TcpListener::bind(bind)
                    .await
                    .with_context(|| format!("failed to listen on {bind}"))?;
                let local = listener.local_addr()?;
                info!(%local, "listening");
                local_addrs.push(local);
                tokio::spawn(accept_loop(
                    listener,
                    Arc::clone(server),
                    Arc::clone(&opts),
                    handle.clone(),
                ));
            }
        }

        let mut cm = ClientManager::new(Arc::clone(&self.cfg), handle.clone());
        // HBRI needs a published hub address on both families somewhere
        let add_hbri = self
            .cfg
            .servers
            .iter()
            .any(|s| s.address4.is_some() && s.address6.is_some());
        cm.prepare_supports(add_hbri);

        let _timer = handle.add_timed_job(Duration::from_secs(1), ClientManager::on_timer_second);

        let cancel = self.cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    job = self.jobs_rx.recv() => match job {
                        Some(job) => job(&mut cm),
                        None => break,
                    },
                }
            }
            debug!("core dispatch loop finished");
        });

        Ok(RunningCore {
            handle,
            local_addrs,
            task,
        })
    }

    /// Runs the hub until shutdown is requested.
    pub async fn run(self) -> Result<()> {
        self.start().await?.wait().await
    }
}

async fn accept_loop(
    listener: TcpListener,
    server: Arc<ServerInfo>,
    opts: Arc<SocketOptions>,
    handle: CoreHandle,
) {
    let cancel = handle.cancelled_token();
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            r = listener.accept() => r,
        };
        match accepted {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                let socket = ManagedSocket::new(
                    Box::new(stream),
                    peer.ip(),
                    Arc::clone(&server),
                    Arc::clone(&opts),
                    handle.clone(),
                );
                handle.post(move |cm| cm.handle_incoming(socket));
            }
            Err(e) => {
                debug!(%e, "accept failed");
            }
        }
    }
}

//! # Skiff Node
//!
//! Command-line chat peer on top of `skiff-transport`. One node hosts; the
//! others join it and every line typed on stdin reaches every member,
//! relayed through the host.
//!
//! ## Usage
//!
//! ```bash
//! # Host on the default port
//! skiff-node host --name alice
//!
//! # Join it, with 20% simulated loss and 10-80 ms of jitter
//! skiff-node join --name bob --host 127.0.0.1:7777 --bind 0.0.0.0:7778 \
//!   --loss 0.2 --latency-ms 10-80
//!
//! # Settings from a file
//! skiff-node host --name alice --config skiff.toml
//! ```
//!
//! Lines starting with `/` are commands: `/ping`, `/stats`, `/who`,
//! `/kick N` (host only), `/quit`.

mod chat;
mod config;

use std::io::BufRead;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::{Receiver, TryRecvError};
use quanta::Clock;
use skiff_transport::{
    ConnectionId, ControlFlags, MessageOptions, Session, SessionEvent, SessionState,
};

use crate::chat::{ChatLine, CHAT};

/// Reliable-UDP chat node.
#[derive(Parser, Debug)]
#[command(name = "skiff-node", about = "Host or join a skiff session")]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Host a session and accept joiners.
    Host(Common),
    /// Join the session hosted at `--host`.
    Join {
        /// Host address.
        #[arg(long)]
        host: SocketAddr,
        #[command(flatten)]
        common: Common,
    },
}

#[derive(Args, Debug)]
struct Common {
    /// Name shown to other members (at most 32 bytes).
    #[arg(long)]
    name: String,

    /// Local bind address; overrides the config file.
    #[arg(long)]
    bind: Option<String>,

    /// TOML session config.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Simulated inbound loss probability.
    #[arg(long)]
    loss: Option<f64>,

    /// Simulated inbound latency, `N` or `MIN-MAX` milliseconds.
    #[arg(long, value_parser = config::parse_latency)]
    latency_ms: Option<(u64, u64)>,

    /// Seed for the simulated channel.
    #[arg(long)]
    seed: Option<u64>,

    /// Never flag or drop silent connections.
    #[arg(long, default_value_t = false)]
    no_timeouts: bool,

    /// Seconds between stats log lines; 0 disables.
    #[arg(long, default_value_t = 10)]
    stats_interval: u64,
}

impl Common {
    fn overrides(&self) -> config::Overrides {
        config::Overrides {
            bind: self.bind.clone(),
            loss: self.loss,
            latency_ms: self.latency_ms,
            seed: self.seed,
            no_timeouts: self.no_timeouts,
        }
    }
}

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    // ── Parse CLI ───────────────────────────────────────────────
    let cli = Cli::parse();
    let (common, host_addr) = match &cli.mode {
        Mode::Host(common) => (common, None),
        Mode::Join { host, common } => (common, Some(*host)),
    };
    let config = config::load(common.config.as_deref(), common.overrides())?;

    tracing::info!(
        name = %common.name,
        bind = %config.bind,
        host = ?host_addr,
        tick_rate_hz = config.tick_rate_hz,
        simulation = ?config.simulation,
        "skiff-node starting"
    );

    // ── Session ─────────────────────────────────────────────────
    let (chat_tx, chat_rx) = crossbeam_channel::unbounded::<(Option<ConnectionId>, Bytes)>();
    let mut session = Session::new(config);
    session.register_message_type(
        CHAT,
        "chat",
        move |ctx, msg| {
            // The main loop outlives the session; a send can only fail during teardown.
            let _ = chat_tx.send((ctx.sender(), msg.payload.clone()));
        },
        MessageOptions::RELIABLE | MessageOptions::INORDER,
        ControlFlags::NONE,
    )?;
    session.start().context("starting session")?;

    match host_addr {
        None => {
            session.host(&common.name)?;
        }
        Some(addr) => session.join(&common.name, addr)?,
    }

    // ── Graceful shutdown ───────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutting down...");
            running.store(false, Ordering::Relaxed);
        })?;
    }

    // ── Stdin reader ────────────────────────────────────────────
    let lines = spawn_stdin_reader()?;

    // ── Main loop ───────────────────────────────────────────────
    let clock = Clock::new();
    let mut last = clock.now();
    let mut last_stats_log = last;
    let stats_interval = Duration::from_secs(common.stats_interval);
    let mut node = Node {
        name: common.name.clone(),
        session,
        chat_rx,
    };

    while running.load(Ordering::Relaxed) {
        let now = clock.now();
        node.session.update(now.saturating_duration_since(last));
        last = now;

        node.deliver_chat();
        if !node.handle_events() {
            break;
        }

        match lines.try_recv() {
            Ok(line) => {
                if !node.handle_line(line.trim()) {
                    break;
                }
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                tracing::info!("stdin closed");
                break;
            }
        }

        // Periodic stats logging
        if !stats_interval.is_zero()
            && now.saturating_duration_since(last_stats_log) >= stats_interval
        {
            node.log_stats();
            last_stats_log = now;
        }

        std::thread::sleep(Duration::from_millis(2));
    }

    // ── Cleanup ─────────────────────────────────────────────────
    if node.session.state() == SessionState::Connected {
        node.session.leave()?;
    }
    node.log_stats();
    node.session.stop();
    tracing::info!("skiff-node stopped");
    Ok(())
}

fn spawn_stdin_reader() -> anyhow::Result<Receiver<String>> {
    let (tx, rx) = crossbeam_channel::bounded(64);
    std::thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })?;
    Ok(rx)
}

// ─── Node ───────────────────────────────────────────────────────────────────

struct Node {
    name: String,
    session: Session,
    chat_rx: Receiver<(Option<ConnectionId>, Bytes)>,
}

impl Node {
    /// Print received lines; the host relays each to everyone but its author.
    fn deliver_chat(&mut self) {
        while let Ok((from, payload)) = self.chat_rx.try_recv() {
            let Some(line) = ChatLine::decode(&payload) else {
                tracing::warn!(?from, len = payload.len(), "malformed chat line");
                continue;
            };
            println!("<{}> {}", line.author, line.text);

            if !self.session.is_host() {
                continue;
            }
            let me = self.session.me();
            let targets: Vec<ConnectionId> = self
                .session
                .connections()
                .map(|c| c.id())
                .filter(|&id| Some(id) != from && Some(id) != me)
                .collect();
            for id in targets {
                if let Err(e) = self.session.send(id, CHAT, payload.clone()) {
                    tracing::warn!(conn = %id, error = %e, "relay failed");
                }
            }
        }
    }

    /// Log session events. Returns `false` once the node should exit.
    fn handle_events(&mut self) -> bool {
        for event in self.session.drain_events() {
            match event {
                SessionEvent::Joined { me, host } => {
                    tracing::info!(%me, %host, "joined session");
                }
                SessionEvent::JoinFailed(code) => {
                    tracing::error!(%code, "join failed");
                    return false;
                }
                SessionEvent::PeerConnected(id) => {
                    let name = self.peer_name(id);
                    tracing::info!(conn = %id, %name, "peer connected");
                }
                SessionEvent::PeerDisconnected(id) => {
                    tracing::info!(conn = %id, "peer disconnected");
                }
                SessionEvent::ConnectionBad(id) => {
                    tracing::warn!(conn = %id, "connection bad");
                }
                SessionEvent::Pong { from, rtt } => {
                    println!("pong from {from}: {:.1} ms", rtt.as_secs_f64() * 1000.0);
                }
                SessionEvent::Disconnected => {
                    tracing::info!(reason = ?self.session.last_error(), "disconnected");
                    return false;
                }
                SessionEvent::Started { .. } | SessionEvent::Hosting { .. } => {}
            }
        }
        true
    }

    /// Run one stdin line. Returns `false` on `/quit`.
    fn handle_line(&mut self, line: &str) -> bool {
        if line.is_empty() {
            return true;
        }
        let mut words = line.split_whitespace();
        match words.next() {
            Some("/quit") => return false,
            Some("/stats") => self.log_stats(),
            Some("/who") => {
                for conn in self.session.connections() {
                    println!(
                        "{} {} {} {:?} srtt={:.1}ms",
                        conn.id(),
                        conn.guid(),
                        conn.addr(),
                        conn.state(),
                        conn.rtt().srtt_us() / 1000.0
                    );
                }
            }
            Some("/ping") => {
                let peers: Vec<SocketAddr> = self
                    .session
                    .connections()
                    .filter(|c| !c.is_local())
                    .map(|c| c.addr())
                    .collect();
                for addr in peers {
                    if let Err(e) = self.session.ping(addr) {
                        tracing::warn!(%addr, error = %e, "ping failed");
                    }
                }
            }
            Some("/kick") => match words.next().and_then(|w| w.parse::<u8>().ok()) {
                Some(index) => {
                    if let Err(e) = self.session.kick(ConnectionId(index)) {
                        println!("kick failed: {e}");
                    }
                }
                None => println!("usage: /kick N"),
            },
            Some(cmd) if cmd.starts_with('/') => println!("unknown command {cmd}"),
            _ => self.say(line),
        }
        true
    }

    fn say(&mut self, text: &str) {
        if self.session.state() != SessionState::Connected {
            println!("not connected yet");
            return;
        }
        let payload = ChatLine::new(&self.name, text).encode();
        match self.session.broadcast(CHAT, payload) {
            Ok(0) => println!("(nobody else here)"),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "chat not sent"),
        }
    }

    fn peer_name(&self, id: ConnectionId) -> String {
        self.session
            .connection(id)
            .map(|c| c.guid().name())
            .unwrap_or_default()
    }

    fn log_stats(&self) {
        let stats = self.session.stats();
        match serde_json::to_string(&stats) {
            Ok(json) => tracing::info!(
                connections = stats.connection_count(),
                resends = stats.totals.reliable_resends,
                duplicates = stats.totals.duplicates_dropped,
                stats = %json,
                "session stats"
            ),
            Err(e) => tracing::warn!(error = %e, "stats serialization failed"),
        }
    }
}

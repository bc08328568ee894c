// ------------------------------------------------------------
// Module declarations
// ------------------------------------------------------------
//
// - error:             Shared error kind + Result alias
// - currency:          CurrencyPair and the pip-factor registry
// - model:             Wire-agnostic normalized market-data model
// - active_quote_table: Per-connection refId reconciliation map
// - book:               OrderBook, QuoteGroup, Filter, FilterView
// - queue:              Bounded multi-threaded message processor
// - timer:              Scheduled executor (autoflush, cleanup, debounce)
// - signing:            HMAC-SHA256 request signing helpers
// - metrics:            Process-wide runtime counters
// - config:             XML session configuration
// - connection:         Per-venue WebSocket connection
// - venues:             Venue adapters (Binance, Coinbase, OKX)
//
mod active_quote_table;
mod book;
mod config;
mod connection;
mod currency;
mod error;
mod metrics;
mod model;
mod queue;
mod signing;
mod timer;
mod venues;

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{error, info, warn};
use rand::Rng;
use rustls::crypto::{ring, CryptoProvider};

use config::{GatewayConfig, SessionConfig};
use connection::{Connection, ConnectionState};
use metrics::METRICS;
use timer::Timer;

const CONFIG_PATH: &str = "gateway.xml";
const AUTOFLUSH_INTERVAL_NS: i64 = 50_000_000;
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);
const STATE_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    // rustls >= 0.23 requires an explicit CryptoProvider installation,
    // done exactly once and as early as possible in the process lifecycle.
    CryptoProvider::install_default(ring::default_provider()).expect("failed to install rustls CryptoProvider");

    let config = load_config(CONFIG_PATH)?;
    let timer = Timer::new();
    timer.start("timer", 1);

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut supervisors = Vec::new();
    let mut current_handles: Vec<Arc<StdMutex<Option<Arc<Connection>>>>> = Vec::new();

    for session in config.active_sessions().cloned() {
        let current = Arc::new(StdMutex::new(None));
        current_handles.push(current.clone());

        let timer = timer.clone();
        let shutdown = shutdown.clone();
        supervisors.push(tokio::spawn(supervise_session(session, timer, shutdown, current)));
    }

    if supervisors.is_empty() {
        warn!("no sessions configured; the gateway will idle with no active venues");
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal, disconnecting {} session(s)", supervisors.len());
        }
        _ = sigterm() => {
            info!("received SIGTERM, disconnecting {} session(s)", supervisors.len());
        }
    }

    shutdown.store(true, Ordering::Release);
    for current in &current_handles {
        let conn = current.lock().unwrap().clone();
        if let Some(conn) = conn {
            conn.disconnect().await;
        }
    }
    for supervisor in supervisors {
        let _ = supervisor.await;
    }
    timer.stop(false);

    Ok(())
}

/// Owns one session's connect/disconnect lifecycle and reconnects it with
/// jittered exponential backoff whenever the socket drops, per §4.1's "outer
/// supervisor may reconnect" contract. A fresh `Connection` (and therefore a
/// fresh `ActiveQuoteTable`/`OrderBook`) is built on every attempt, so a
/// reconnect always re-bootstraps from a venue snapshot rather than trying
/// to patch a possibly-gapped book.
async fn supervise_session(session: SessionConfig, timer: Arc<Timer>, shutdown: Arc<AtomicBool>, current: Arc<StdMutex<Option<Arc<Connection>>>>) {
    let mut backoff = RECONNECT_BASE;
    let mut attempt = 0u32;

    while !shutdown.load(Ordering::Acquire) {
        let conn = match Connection::new(session.clone(), timer.clone()) {
            Ok(conn) => conn,
            Err(e) => {
                error!("session '{}': failed to construct connection: {e}", session.name);
                sleep_with_jitter(backoff).await;
                backoff = next_backoff(backoff);
                continue;
            }
        };

        info!("session '{}': connecting ({:?}), attempt {attempt}", session.name, session.schema);
        if let Err(e) = conn.connect().await {
            error!("session '{}': connect failed: {e}", session.name);
            if attempt > 0 {
                METRICS.ws_reconnects.fetch_add(1, Ordering::Relaxed);
            }
            sleep_with_jitter(backoff).await;
            backoff = next_backoff(backoff);
            attempt += 1;
            continue;
        }

        if attempt > 0 {
            METRICS.ws_reconnects.fetch_add(1, Ordering::Relaxed);
        }
        backoff = RECONNECT_BASE;
        *current.lock().unwrap() = Some(conn.clone());

        let autoflush_conn = conn.clone();
        let autoflush_name = format!("{}_autoflush_{attempt}", session.name);
        let task_id = timer.schedule(
            &autoflush_name,
            Arc::new(move || autoflush_conn.on_flush()),
            AUTOFLUSH_INTERVAL_NS,
            AUTOFLUSH_INTERVAL_NS,
            None,
        );

        while conn.state() != ConnectionState::Disconnected && !shutdown.load(Ordering::Acquire) {
            tokio::time::sleep(STATE_POLL_INTERVAL).await;
        }
        timer.cancel(task_id);
        *current.lock().unwrap() = None;

        if shutdown.load(Ordering::Acquire) {
            break;
        }
        warn!("session '{}': connection dropped, reconnecting", session.name);
        attempt += 1;
        sleep_with_jitter(backoff).await;
        backoff = next_backoff(backoff);
    }
}

fn next_backoff(current: Duration) -> Duration {
    std::cmp::min(current * 2, RECONNECT_MAX)
}

async fn sleep_with_jitter(base: Duration) {
    let jitter_ms = rand::rng().random_range(0..250);
    tokio::time::sleep(base + Duration::from_millis(jitter_ms)).await;
}

#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(_) => futures_util::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    futures_util::future::pending::<()>().await
}

fn load_config(path: &str) -> anyhow::Result<GatewayConfig> {
    let xml = fs::read_to_string(path)?;
    Ok(GatewayConfig::from_xml(&xml)?)
}

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use once_cell::sync::Lazy;

/// Global runtime metrics for the gateway.
///
/// Purpose:
/// - Track active sessions and their connection state
/// - Track active instruments per order book
/// - Track throughput (received / published entries)
///
/// Design:
/// - Lock-free (Atomics)
/// - Cheap to update
/// - Safe across the tokio connection layer and the OS-thread queue/timer
#[derive(Default)]
pub struct RuntimeMetrics {
    // High-level
    pub sessions_active: AtomicUsize,

    // WebSocket level
    pub ws_connections_active: AtomicUsize,
    pub ws_reconnects: AtomicUsize,

    // Book
    pub book_pairs_active: AtomicUsize,
    pub quotes_published: AtomicUsize,
    pub quotes_removed: AtomicUsize,

    // Throughput
    pub entries_received: AtomicUsize,
    pub entries_processed: AtomicUsize,

    pub parse_errors: AtomicUsize,
    pub send_errors: AtomicUsize,
    pub dropped_messages: AtomicUsize,
    pub queue_full_rejections: AtomicUsize,

    pub subscriptions_sent: AtomicUsize,
    pub subscription_errors: AtomicUsize,
}

/// Global metrics registry (singleton)
pub static METRICS: Lazy<Arc<RuntimeMetrics>> = Lazy::new(|| Arc::new(RuntimeMetrics::default()));

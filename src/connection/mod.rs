//! Per-venue connection: owns one WebSocket, a dedicated `MessageProcessor`,
//! an `ActiveQuoteTable`, and the `OrderBook` that table reconciles into.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{error, warn};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::active_quote_table::ActiveQuoteTable;
use crate::book::order_book::ATTR_BATCHSIZE;
use crate::book::{NewQuoteArgs, OrderBook};
use crate::config::SessionConfig;
use crate::currency::CurrencyPair;
use crate::error::{GatewayError, Result};
use crate::metrics::METRICS;
use crate::model::{MdEntry, NormalizedMDData, QuoteType, UpdateType};
use crate::queue::{MessageProcessor, MAX_QUEUESIZE};
use crate::timer::{now_ns, Timer};
use crate::venues::{self, ParseOutcome, VenueAdapter};

const MAX_FRAME_BYTES: usize = 2 * 1024 * 1024;
const MAX_LISTENER_EXCEPTIONS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
    Disconnecting,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct Connection {
    session: SessionConfig,
    adapter: Arc<dyn VenueAdapter>,
    instruments: StdMutex<Vec<CurrencyPair>>,
    state: RwLock<ConnectionState>,
    active_quotes: ActiveQuoteTable,
    book: Arc<OrderBook>,
    processor: Arc<MessageProcessor>,
    timer: Arc<Timer>,
    last_message_time: AtomicI64,
    write: AsyncMutex<Option<SplitSink<WsStream, Message>>>,
    listener: StdMutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub fn new(session: SessionConfig, timer: Arc<Timer>) -> Result<Arc<Self>> {
        let adapter = venues::for_schema(session.schema);
        let instruments = session
            .instruments
            .iter()
            .map(|s| CurrencyPair::parse(s))
            .collect::<Result<Vec<_>>>()?;
        let processor = MessageProcessor::new(MAX_QUEUESIZE, true, ATTR_BATCHSIZE);

        Ok(Arc::new(Self {
            session,
            adapter,
            instruments: StdMutex::new(instruments),
            state: RwLock::new(ConnectionState::Disconnected),
            active_quotes: ActiveQuoteTable::new(),
            book: Arc::new(OrderBook::new()),
            processor,
            timer,
            last_message_time: AtomicI64::new(0),
            write: AsyncMutex::new(None),
            listener: StdMutex::new(None),
        }))
    }

    pub fn book(&self) -> Arc<OrderBook> {
        self.book.clone()
    }

    pub fn name(&self) -> &str {
        &self.session.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap()
    }

    pub fn last_message_time(&self) -> i64 {
        self.last_message_time.load(Ordering::Acquire)
    }

    /// Driven by the shared `Timer`'s autoflush task so queued items behind
    /// the batch threshold eventually run even during a quiet period.
    pub fn on_flush(&self) {
        self.processor.on_flush();
    }

    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        *self.state.write().unwrap() = ConnectionState::Connecting;
        let url = self.adapter.ws_url(&self.session);
        let (ws, _) = connect_async(&url)
            .await
            .map_err(|e| GatewayError::TransportError(format!("connect {url}: {e}")))?;
        let (write, read) = ws.split();
        *self.write.lock().await = Some(write);
        *self.state.write().unwrap() = ConnectionState::Connected;
        METRICS.ws_connections_active.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        METRICS.sessions_active.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        self.register_handlers();
        self.processor.start(&self.session.name, 1);

        let listener_conn = self.clone();
        let handle = tokio::spawn(async move { listener_conn.listen(read).await });
        *self.listener.lock().unwrap() = Some(handle);

        let instruments = self.instruments.lock().unwrap().clone();
        if self.adapter.subscribe_before_snapshot() {
            self.subscribe(&instruments).await?;
            self.bootstrap_snapshots().await;
        } else {
            self.bootstrap_snapshots().await;
            self.subscribe(&instruments).await?;
        }

        *self.state.write().unwrap() = ConnectionState::Subscribed;
        Ok(())
    }

    pub async fn disconnect(self: &Arc<Self>) {
        *self.state.write().unwrap() = ConnectionState::Disconnecting;
        if let Some(mut write) = self.write.lock().await.take() {
            let _ = write.close().await;
        }
        if let Some(handle) = self.listener.lock().unwrap().take() {
            handle.abort();
        }
        self.processor.stop(true, false);
        *self.state.write().unwrap() = ConnectionState::Disconnected;
        METRICS.ws_connections_active.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
        METRICS.sessions_active.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub async fn subscribe(&self, instruments: &[CurrencyPair]) -> Result<()> {
        let msg = self.adapter.build_subscribe(&self.session, instruments);
        let result = self.send_json(&msg).await;
        match &result {
            Ok(()) => METRICS.subscriptions_sent.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            Err(_) => METRICS.subscription_errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
        };
        result
    }

    pub async fn unsubscribe(&self, instruments: &[CurrencyPair]) -> Result<()> {
        let msg = self.adapter.build_unsubscribe(&self.session, instruments);
        self.send_json(&msg).await
    }

    async fn send_json(&self, msg: &Value) -> Result<()> {
        let mut guard = self.write.lock().await;
        let Some(write) = guard.as_mut() else {
            return Err(GatewayError::NotInitialized);
        };
        write.send(Message::Text(Utf8Bytes::from(msg.to_string()))).await.map_err(|e| {
            METRICS.send_errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            GatewayError::TransportError(format!("send: {e}"))
        })
    }

    async fn bootstrap_snapshots(self: &Arc<Self>) {
        let instruments = self.instruments.lock().unwrap().clone();
        for cp in instruments {
            self.bootstrap_one(&cp).await;
        }
    }

    async fn bootstrap_one(self: &Arc<Self>, cp: &CurrencyPair) {
        let now = now_ns();
        match self.adapter.fetch_snapshot(&self.session, cp, now).await {
            Ok(nmd) if !nmd.entries.is_empty() => self.publish_quotes(nmd, now),
            Ok(_) => {}
            Err(e) => warn!("{}: snapshot fetch failed for {cp}: {e}", self.session.name),
        }
    }

    /// Adds a single instrument to a live, already-subscribed connection:
    /// issues a venue subscribe for just that instrument and bootstraps its
    /// snapshot. A no-op (with a warning) if already subscribed.
    pub async fn subscribe_instrument(self: &Arc<Self>, cp: CurrencyPair) -> Result<()> {
        {
            let mut instruments = self.instruments.lock().unwrap();
            if instruments.contains(&cp) {
                warn!("{}: {cp} is already subscribed", self.session.name);
                return Ok(());
            }
            instruments.push(cp.clone());
        }
        self.subscribe(std::slice::from_ref(&cp)).await?;
        self.bootstrap_one(&cp).await;
        Ok(())
    }

    /// Removes a single instrument from a live connection: issues a venue
    /// unsubscribe and drops it from the tracked instrument set. A no-op
    /// (with a warning) if not currently subscribed.
    pub async fn unsubscribe_instrument(&self, cp: &CurrencyPair) -> Result<()> {
        {
            let mut instruments = self.instruments.lock().unwrap();
            let Some(idx) = instruments.iter().position(|existing| existing == cp) else {
                warn!("{}: {cp} is not currently subscribed", self.session.name);
                return Ok(());
            };
            instruments.remove(idx);
        }
        self.unsubscribe(std::slice::from_ref(cp)).await
    }

    /// Both `register_type_detector`/`register_handler` collapse every
    /// frame to a single logical message type: `publish_quotes` is already
    /// single-threaded per call, so there's no benefit to classifying
    /// further before the queue, and doing so here would just duplicate
    /// the venue's own `detect_type`.
    fn register_handlers(self: &Arc<Self>) {
        let _ = self.processor.register_type_detector(Arc::new(|_doc: &Value| "frame".to_string()));
        let handler_conn = self.clone();
        let _ = self.processor.register_handler(
            "frame",
            Arc::new(move |doc: Value| handler_conn.handle_frame(doc)),
        );
    }

    fn handle_frame(&self, doc: Value) {
        let now = now_ns();
        METRICS.entries_received.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let msg_type = self.adapter.detect_type(&doc);
        match self.adapter.parse_message(&msg_type, &doc, now) {
            Ok(ParseOutcome::Control) => {}
            Ok(ParseOutcome::Data(nmd)) => {
                METRICS.entries_processed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.publish_quotes(nmd, now);
            }
            Err(e) => {
                METRICS.parse_errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                warn!("{}: failed to parse '{msg_type}' frame: {e}", self.session.name);
            }
        }
    }

    async fn listen(self: Arc<Self>, mut read: SplitStream<WsStream>) {
        let mut exceptions = 0u32;
        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Ping(payload)) => {
                    if let Some(write) = self.write.lock().await.as_mut() {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                }
                Ok(Message::Pong(_)) => {}
                Ok(Message::Close(_)) => break,
                Ok(Message::Text(text)) => {
                    if text.len() > MAX_FRAME_BYTES {
                        warn!("{}: dropping oversize frame ({} bytes)", self.session.name, text.len());
                        METRICS.dropped_messages.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        exceptions += 1;
                    } else {
                        match serde_json::from_str::<Value>(&text) {
                            Ok(doc) => {
                                if let Err(e) = self.processor.process_message(doc) {
                                    if matches!(e, GatewayError::QueueFull) {
                                        METRICS.queue_full_rejections.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                                    }
                                    warn!("{}: process_message failed: {e}", self.session.name);
                                }
                                self.last_message_time.store(now_ns(), Ordering::Release);
                                exceptions = 0;
                            }
                            Err(e) => {
                                warn!("{}: failed to parse frame as json: {e}", self.session.name);
                                exceptions += 1;
                            }
                        }
                    }
                }
                Ok(Message::Binary(_)) | Ok(Message::Frame(_)) => {}
                Err(e) => {
                    warn!("{}: socket read error: {e}", self.session.name);
                    exceptions += 1;
                }
            }

            if exceptions > MAX_LISTENER_EXCEPTIONS {
                error!(
                    "{}: exceeded {MAX_LISTENER_EXCEPTIONS} consecutive listener exceptions, tearing down",
                    self.session.name
                );
                break;
            }
        }
        *self.state.write().unwrap() = ConnectionState::Disconnected;
    }

    /// §4.3: reconcile each entry against the `ActiveQuoteTable` (inheriting
    /// missing fields, rotating or suppressing the downstream key, and
    /// reclassifying New/Update/Delete against prior existence) before
    /// forwarding to the `OrderBook`. All entries of one message run here
    /// in message order, on the single handler invocation that owns them.
    fn publish_quotes(&self, nmd: NormalizedMDData, now: i64) {
        let sequence_tag = empty_message_sequence_tag();
        for mut entry in nmd.entries {
            entry.sequence_tag = sequence_tag;
            self.publish_entry(entry, now);
        }
    }

    fn publish_entry(&self, mut entry: MdEntry, now: i64) {
        if (entry.entry_type == QuoteType::Invalid || !entry.instrument.valid()) && !entry.ref_id.is_empty() {
            match self.active_quotes.find_quote_info(&entry.ref_id) {
                Some(prior) => {
                    entry.entry_type = prior.entry_type;
                    entry.instrument = prior.cp.clone();
                }
                None => {
                    warn!("{}: unresolved entry for refId {}", self.session.name, entry.ref_id);
                    return;
                }
            }
        }

        let key = self.active_quotes.new_monotonic_key();

        if entry.update_type == UpdateType::Delete {
            let Some(prior) = self.active_quotes.remove_quote_info(&entry.ref_id) else {
                warn!("{}: delete with no matching refId {}", self.session.name, entry.ref_id);
                return;
            };
            self.book
                .add_entry(&entry.instrument, UpdateType::Delete, new_quote_args(key, prior.key, &entry, now), now);
            METRICS.quotes_removed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return;
        }

        let hash_value = ActiveQuoteTable::calculate_hash_value(entry.volume, &entry.price, entry.min_qty, &entry.quote_id);
        let (prior, _skip_key) = self.active_quotes.replace_quote_info(
            key,
            &entry.ref_id,
            &entry.id,
            entry.instrument.clone(),
            entry.entry_type,
            hash_value,
            entry.sequence_tag,
            false,
        );

        let update_type = match (&prior, entry.update_type) {
            (Some(_), UpdateType::New) => UpdateType::Update,
            (None, UpdateType::Update) => UpdateType::New,
            (None, UpdateType::Delete) => {
                warn!("{}: delete reclassification with no prior for refId {}", self.session.name, entry.ref_id);
                return;
            }
            (_, other) => other,
        };

        let ref_key = prior.map(|p| p.key).unwrap_or(0);
        self.book
            .add_entry(&entry.instrument, update_type, new_quote_args(key, ref_key, &entry, now), now);
        METRICS.quotes_published.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}

fn new_quote_args(key: i64, ref_key: i64, entry: &MdEntry, now: i64) -> NewQuoteArgs {
    let price_f64: f64 = entry.price.parse().unwrap_or(0.0);
    NewQuoteArgs {
        key,
        ref_key,
        adpt_receive_time: entry.adpt_receive_time,
        receipt_time: now,
        sort_time: now,
        quote_id: entry.quote_id.clone(),
        seqnum: 0,
        price: entry.instrument.dbl_to_cpip(price_f64),
        volume: entry.instrument.qty_to_i64(entry.volume),
        min_qty: entry.instrument.qty_to_i64(entry.min_qty),
        sending_time: now,
        side: entry.entry_type,
        position_no: entry.position_no,
        settl_date: 0,
        originator: String::new(),
    }
}

fn empty_message_sequence_tag() -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    "".hash(&mut hasher);
    hasher.finish()
}

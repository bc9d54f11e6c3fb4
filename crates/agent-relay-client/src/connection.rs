//! Single-active-connection manager.
//!
//! At most one server-push stream is open per process, following the
//! session that is both selected and believed running. The reader task
//! feeds chunks through the carry-over line buffer, classifies each line,
//! and dispatches effects on the session store. Transport failures retry
//! with exponential backoff up to a cap; a mid-stream rekey moves the
//! session's state without closing the stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use agent_relay_core::{DeltaThrottle, SessionId, SessionStore};
use agent_relay_events::{Envelope, LifecycleEnvelope, dispatch, parse_line};
use futures::StreamExt;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::api::SessionApi;
use crate::config::RetryConfig;
use crate::effects::ConnEffects;
use crate::transport::{ByteStream, StreamTransport, TransportError};

/// Connection state, observable for tests and status displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Closed,
    Connecting,
    Open,
    /// Waiting to reconnect; the payload is the attempt count.
    Retrying(u32),
}

struct ActiveConn {
    /// Mutable current-session-id cell; read at dispatch time so a rekey
    /// never leaves a handler holding a stale id.
    cell: Arc<StdRwLock<SessionId>>,
    /// One-shot marker: the id this connection was rekeyed away from.
    /// Suppresses the "target changed" close when the selection still
    /// names the pre-rekey id.
    rekeyed_from: Arc<StdMutex<Option<SessionId>>>,
    generation: u64,
    task: JoinHandle<()>,
}

/// Owns the at-most-one live stream and its lifecycle decisions.
pub struct ConnectionManager {
    store: Arc<SessionStore>,
    transport: Arc<dyn StreamTransport>,
    api: Arc<dyn SessionApi>,
    retry: RetryConfig,
    flush_interval: Duration,
    active: Arc<Mutex<Option<ActiveConn>>>,
    /// Generation of the most recently opened connection. Retry timers
    /// and readers re-check this at fire-time; a stale generation means
    /// the connection was superseded and must not touch current state.
    latest_generation: Arc<AtomicU64>,
    state_tx: watch::Sender<ConnState>,
    state_rx: watch::Receiver<ConnState>,
}

impl ConnectionManager {
    /// Create a manager. No connection is opened until `sync_target`.
    #[must_use]
    pub fn new(
        store: Arc<SessionStore>,
        transport: Arc<dyn StreamTransport>,
        api: Arc<dyn SessionApi>,
        retry: RetryConfig,
        flush_interval: Duration,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnState::Closed);
        Self {
            store,
            transport,
            api,
            retry,
            flush_interval,
            active: Arc::new(Mutex::new(None)),
            latest_generation: Arc::new(AtomicU64::new(0)),
            state_tx,
            state_rx,
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnState {
        *self.state_rx.borrow()
    }

    /// Watch connection state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnState> {
        self.state_rx.clone()
    }

    /// The session the live connection currently belongs to.
    pub async fn current_session(&self) -> Option<SessionId> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|c| c.cell.read().unwrap().clone())
    }

    /// Reconcile the connection with the UI's selection and run intent.
    ///
    /// Opens, keeps, or closes the stream so that it always follows the
    /// session that is both selected and running. A selection still
    /// naming the pre-rekey id of the live stream is the same logical
    /// stream and does not close it (one-shot).
    pub async fn sync_target(&self, selected: Option<&SessionId>, running: bool) {
        let target = if running { selected.cloned() } else { None };
        let mut active = self.active.lock().await;

        if let Some(conn) = active.as_ref() {
            let current = conn.cell.read().unwrap().clone();
            if target.as_ref() == Some(&current) {
                return;
            }
            if let Some(t) = target.as_ref() {
                let mut from = conn.rekeyed_from.lock().unwrap();
                if from.as_ref() == Some(t) {
                    from.take();
                    return;
                }
            }
            if let Some(conn) = active.take() {
                self.close_conn(conn).await;
            }
        }

        if let Some(target) = target {
            self.open_locked(&mut active, target);
        }
    }

    /// Close the live connection, if any.
    pub async fn shutdown(&self) {
        let mut active = self.active.lock().await;
        if let Some(conn) = active.take() {
            self.close_conn(conn).await;
        }
    }

    /// Abort the reader, flush the pending throttled delta, and finalize
    /// the draft before the handle is cleared. Switching away must never
    /// silently drop a chunk that was received but not yet rendered.
    ///
    /// The abort is awaited before finalize: the reader keeps running
    /// until its next await point, and a delta it applies after the draft
    /// was committed would clobber the finalized trailing message.
    async fn close_conn(&self, conn: ActiveConn) {
        conn.task.abort();
        if let Err(e) = conn.task.await {
            if !e.is_cancelled() {
                tracing::warn!(error = %e, "stream reader ended abnormally");
            }
        }
        let id = conn.cell.read().unwrap().clone();
        tracing::debug!(session = %id, "closing stream connection");
        self.store.finalize(&id);
        let _ = self.state_tx.send(ConnState::Closed);
    }

    fn open_locked(&self, active: &mut Option<ActiveConn>, target: SessionId) {
        let generation = self.latest_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cell = Arc::new(StdRwLock::new(target.clone()));
        let rekeyed_from = Arc::new(StdMutex::new(None));
        self.store.touch(&target);
        tracing::debug!(session = %target, generation, "opening stream connection");

        let ctx = Reader {
            store: Arc::clone(&self.store),
            transport: Arc::clone(&self.transport),
            api: Arc::clone(&self.api),
            retry: self.retry.clone(),
            flush_interval: self.flush_interval,
            cell: Arc::clone(&cell),
            rekeyed_from: Arc::clone(&rekeyed_from),
            generation,
            latest_generation: Arc::clone(&self.latest_generation),
            active: Arc::clone(&self.active),
            state_tx: self.state_tx.clone(),
        };
        let task = tokio::spawn(ctx.run());

        *active = Some(ActiveConn {
            cell,
            rekeyed_from,
            generation,
            task,
        });
    }
}

enum StreamOutcome {
    /// Server intentionally ended the stream.
    Graceful { exit_code: Option<i32> },
    /// Transport failed; retry with backoff.
    Failed(TransportError),
    /// A newer connection replaced this one; stop without side effects.
    Superseded,
}

struct Reader {
    store: Arc<SessionStore>,
    transport: Arc<dyn StreamTransport>,
    api: Arc<dyn SessionApi>,
    retry: RetryConfig,
    flush_interval: Duration,
    cell: Arc<StdRwLock<SessionId>>,
    rekeyed_from: Arc<StdMutex<Option<SessionId>>>,
    generation: u64,
    latest_generation: Arc<AtomicU64>,
    active: Arc<Mutex<Option<ActiveConn>>>,
    state_tx: watch::Sender<ConnState>,
}

impl Reader {
    async fn run(self) {
        let mut attempt: u32 = 0;
        let mut reconnect = false;
        loop {
            let _ = self.state_tx.send(ConnState::Connecting);
            let session = self.current_session();

            // Every attempt after the first asks the server to skip
            // replaying history the client already buffered.
            let error = match self.transport.open(&session, reconnect).await {
                Ok(stream) => {
                    let _ = self.state_tx.send(ConnState::Open);
                    attempt = 0;
                    match self.read_stream(stream).await {
                        StreamOutcome::Graceful { exit_code } => {
                            self.finish_gracefully(exit_code).await;
                            return;
                        }
                        StreamOutcome::Superseded => return,
                        StreamOutcome::Failed(e) => e,
                    }
                }
                Err(e) => e,
            };

            attempt += 1;
            reconnect = true;
            if attempt > self.retry.max_retries {
                let session = self.current_session();
                tracing::warn!(
                    session = %session,
                    attempts = attempt - 1,
                    "retry budget exhausted; surfacing disconnect"
                );
                self.store.mark_disconnected(&session);
                let _ = self.state_tx.send(ConnState::Closed);
                self.clear_handle().await;
                return;
            }

            // Silent up to the cap.
            tracing::debug!(session = %session, attempt, error = %error, "stream retry scheduled");
            let _ = self.state_tx.send(ConnState::Retrying(attempt));
            tokio::time::sleep(self.retry.delay_for(attempt)).await;

            // The timer may have outlived this connection; operate only
            // on the current one.
            if !self.still_current() {
                return;
            }
        }
    }

    async fn read_stream(&self, mut stream: ByteStream) -> StreamOutcome {
        let mut fx = ConnEffects::new(Arc::clone(&self.store), Arc::clone(&self.cell));
        let mut throttle = DeltaThrottle::new(self.flush_interval);

        loop {
            tokio::select! {
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        if !self.still_current() {
                            return StreamOutcome::Superseded;
                        }
                        let text = String::from_utf8_lossy(&bytes).into_owned();
                        let session = fx.current_session();
                        for line in self.store.feed_chunk(&session, &text) {
                            if let Some(outcome) = self.handle_line(&line, &mut fx, &mut throttle) {
                                return outcome;
                            }
                        }
                    }
                    Some(Err(e)) => return StreamOutcome::Failed(e),
                    None => {
                        // EOF without a stream_end event. The end marker
                        // may sit in the carry as a final unterminated line.
                        let session = fx.current_session();
                        if let Some(line) = self.store.flush_carry(&session) {
                            if let Some(outcome) = self.handle_line(&line, &mut fx, &mut throttle) {
                                return outcome;
                            }
                        }
                        return StreamOutcome::Failed(TransportError::Exhausted);
                    }
                },
                () = tokio::time::sleep(self.flush_interval), if throttle.has_pending() => {
                    if throttle.drain(Instant::now()) {
                        self.store.notify_transcript(&fx.current_session());
                    }
                }
            }
        }
    }

    /// Classify and apply one sanitized line. Returns a terminal outcome
    /// for the distinguished end-of-stream event.
    fn handle_line(
        &self,
        line: &str,
        fx: &mut ConnEffects,
        throttle: &mut DeltaThrottle,
    ) -> Option<StreamOutcome> {
        match parse_line(line) {
            Envelope::Lifecycle(lifecycle) => {
                self.apply_lifecycle(lifecycle, fx);
                None
            }
            Envelope::End { exit_code } => Some(StreamOutcome::Graceful { exit_code }),
            Envelope::Provider(event) => {
                dispatch(event, fx);
                self.flush_appended(fx, throttle);
                None
            }
            Envelope::Ignored => None,
            Envelope::Text(text) => {
                use agent_relay_events::SessionEffects as _;
                fx.append_delta(&text);
                fx.set_running();
                self.flush_appended(fx, throttle);
                None
            }
        }
    }

    /// A lifecycle envelope rekeys the running session in place: the
    /// store entry moves, the id cell is updated, and the stream stays
    /// open. The old id is remembered once so the target-sync logic does
    /// not mistake the change for a user-driven switch.
    fn apply_lifecycle(&self, lifecycle: LifecycleEnvelope, fx: &mut ConnEffects) {
        use agent_relay_events::SessionEffects as _;
        let new_id = SessionId::durable(lifecycle.session_id);
        let old = fx.current_session();
        if old != new_id {
            tracing::debug!(from = %old, to = %new_id, "rekeying session mid-stream");
            fx.rekey(new_id.clone());
            *self.rekeyed_from.lock().unwrap() = Some(old);
        }
        self.store
            .set_run_metadata(&new_id, lifecycle.permission_mode, lifecycle.allowed_tools);
        self.store.begin_turn(&new_id);
    }

    fn flush_appended(&self, fx: &mut ConnEffects, throttle: &mut DeltaThrottle) {
        let appended = fx.take_appended();
        if !appended.is_empty() && throttle.offer(Instant::now(), &appended) {
            self.store.notify_transcript(&fx.current_session());
        }
    }

    async fn finish_gracefully(&self, exit_code: Option<i32>) {
        let session = self.current_session();
        let abnormal = exit_code.is_some_and(|code| code != 0);
        tracing::debug!(session = %session, ?exit_code, "stream ended gracefully");

        // Push any buffered partial line through the parser one last time.
        let mut fx = ConnEffects::new(Arc::clone(&self.store), Arc::clone(&self.cell));
        let mut throttle = DeltaThrottle::new(self.flush_interval);
        if let Some(line) = self.store.flush_carry(&session) {
            self.handle_line(&line, &mut fx, &mut throttle);
        }

        self.store.set_terminated_abnormally(&session, abnormal);
        self.store.finalize(&session);
        let _ = self.state_tx.send(ConnState::Closed);
        self.clear_handle().await;

        // A background session that finished while not displayed gets its
        // durable transcript from the replay endpoint; local buffers may
        // be incomplete.
        if !self.store.is_displayed(&session) && !self.store.has_draft(&session) {
            match self.api.replay(&session).await {
                Ok(history) => {
                    if let Err(e) = self.store.merge_history(&session, history) {
                        tracing::warn!(session = %session, error = %e, "reconciliation skipped");
                    }
                }
                Err(e) => {
                    tracing::warn!(session = %session, error = %e, "reconciliation fetch failed");
                }
            }
        }
    }

    fn current_session(&self) -> SessionId {
        self.cell.read().unwrap().clone()
    }

    fn still_current(&self) -> bool {
        self.latest_generation.load(Ordering::SeqCst) == self.generation
    }

    async fn clear_handle(&self) {
        let mut active = self.active.lock().await;
        if active
            .as_ref()
            .is_some_and(|c| c.generation == self.generation)
        {
            *active = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockApi;
    use crate::transport::ChannelTransport;
    use agent_relay_core::{Message, Role, RunStatus};

    fn delta(text: &str) -> String {
        format!(
            "{{\"type\":\"message_update\",\"assistantMessageEvent\":{{\"type\":\"text_delta\",\"delta\":\"{text}\"}}}}\n"
        )
    }

    fn stream_end(code: i32) -> String {
        format!("{{\"type\":\"stream_end\",\"exitCode\":{code}}}\n")
    }

    struct Harness {
        store: Arc<SessionStore>,
        transport: Arc<ChannelTransport>,
        api: Arc<MockApi>,
        manager: ConnectionManager,
    }

    fn harness(retry: RetryConfig) -> Harness {
        let store = Arc::new(SessionStore::new());
        let transport = Arc::new(ChannelTransport::new());
        let api = Arc::new(MockApi::default());
        let manager = ConnectionManager::new(
            Arc::clone(&store),
            Arc::clone(&transport) as Arc<dyn StreamTransport>,
            Arc::clone(&api) as Arc<dyn SessionApi>,
            retry,
            Duration::from_millis(10),
        );
        Harness {
            store,
            transport,
            api,
            manager,
        }
    }

    async fn wait_open(manager: &ConnectionManager) {
        let mut rx = manager.watch_state();
        rx.wait_for(|s| *s == ConnState::Open).await.unwrap();
    }

    /// Wait for the reader task to clear its handle. State-based waits
    /// are unreliable here: the initial watch value is already `Closed`,
    /// and a fast reader can burn through every state in one poll.
    async fn wait_closed(manager: &ConnectionManager) {
        for _ in 0..1000 {
            if manager.current_session().await.is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("connection never closed");
    }

    #[tokio::test]
    async fn graceful_end_finalizes_and_goes_idle() {
        // Two deltas then a clean exit: final message is "hihi", idle,
        // and no abnormal-termination flag.
        let h = harness(RetryConfig::default());
        let id = SessionId::durable("s1");
        h.store.set_displayed(Some(id.clone()));
        h.transport
            .push_chunks([delta("hi"), delta("hi"), stream_end(0)]);

        h.manager.sync_target(Some(&id), true).await;
        wait_closed(&h.manager).await;

        let (messages, draft) = h.store.transcript(&id).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::Assistant);
        assert_eq!(messages[0].content, "hihi");
        assert!(draft.is_empty());
        assert_eq!(h.store.run_status(&id), Some(RunStatus::Idle));
        assert!(!h.store.terminated_abnormally(&id));
        assert_eq!(h.api.replay_calls(), 0);
    }

    #[tokio::test]
    async fn nonzero_exit_code_sets_abnormal_flag() {
        let h = harness(RetryConfig::default());
        let id = SessionId::durable("s1");
        h.store.set_displayed(Some(id.clone()));
        h.transport.push_chunks([delta("oops"), stream_end(1)]);

        h.manager.sync_target(Some(&id), true).await;
        wait_closed(&h.manager).await;

        assert!(h.store.terminated_abnormally(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_backoff_then_recovers_without_data_loss() {
        // Transport errors three times before succeeding; with a cap of
        // five the connection ends Open and pre-failure data survives.
        let h = harness(RetryConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_retries: 5,
        });
        let id = SessionId::durable("s1");
        h.store.set_displayed(Some(id.clone()));

        h.transport
            .push_chunks_then_error([delta("before ")], TransportError::Stream("reset".into()));
        h.transport.push_failure(TransportError::Connect("refused".into()));
        h.transport.push_failure(TransportError::Connect("refused".into()));
        let live = h.transport.push_live();

        h.manager.sync_target(Some(&id), true).await;
        let mut rx = h.manager.watch_state();
        let mut seen_retry = false;
        rx.wait_for(|s| {
            if matches!(s, ConnState::Retrying(_)) {
                seen_retry = true;
            }
            seen_retry && *s == ConnState::Open
        })
        .await
        .unwrap();
        live.send(Ok(delta("after").into())).unwrap();

        // Still open, and both halves of the transcript are present.
        tokio::task::yield_now().await;
        assert_eq!(h.manager.state(), ConnState::Open);
        let (messages, _) = h.store.transcript(&id).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "before after");
    }

    #[tokio::test(start_paused = true)]
    async fn exceeding_retry_cap_surfaces_disconnect_and_preserves_transcript() {
        let h = harness(RetryConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            max_retries: 2,
        });
        let id = SessionId::durable("s1");
        h.store.set_displayed(Some(id.clone()));
        h.transport
            .push_chunks_then_error([delta("kept")], TransportError::Stream("reset".into()));
        h.transport.push_failure(TransportError::Connect("refused".into()));
        h.transport.push_failure(TransportError::Connect("refused".into()));

        h.manager.sync_target(Some(&id), true).await;
        wait_closed(&h.manager).await;

        assert!(h.store.is_disconnected(&id));
        let (messages, _) = h.store.transcript(&id).unwrap();
        assert_eq!(messages[0].content, "kept");
        assert!(h.manager.current_session().await.is_none());
    }

    #[tokio::test]
    async fn lifecycle_rekeys_in_place_without_reconnect() {
        let h = harness(RetryConfig::default());
        let provisional = SessionId::provisional();
        h.store.set_displayed(Some(provisional.clone()));
        let live = h.transport.push_live();

        h.manager.sync_target(Some(&provisional), true).await;
        wait_open(&h.manager).await;

        live.send(Ok(delta("early ").into())).unwrap();
        live.send(Ok("{\"sessionId\":\"s-durable\",\"permissionMode\":\"default\"}\n"
            .into()))
            .unwrap();
        live.send(Ok(delta("late").into())).unwrap();
        tokio::task::yield_now().await;

        let durable = SessionId::durable("s-durable");
        let mut rx = h.manager.watch_state();
        // Still the same open stream.
        assert_eq!(*rx.borrow_and_update(), ConnState::Open);
        assert!(!h.store.contains(&provisional));
        let (messages, _) = h.store.transcript(&durable).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "early late");
        assert_eq!(h.manager.current_session().await, Some(durable));
    }

    #[tokio::test]
    async fn rekey_suppression_keeps_stream_on_stale_selection() {
        let h = harness(RetryConfig::default());
        let provisional = SessionId::provisional();
        let live = h.transport.push_live();

        h.manager.sync_target(Some(&provisional), true).await;
        wait_open(&h.manager).await;
        live.send(Ok("{\"sessionId\":\"s1\"}\n".into())).unwrap();
        tokio::task::yield_now().await;

        // The UI has not learned the new id yet; its selection still says
        // the provisional id. One-shot: the stream must survive.
        h.manager.sync_target(Some(&provisional), true).await;
        assert_eq!(h.manager.state(), ConnState::Open);
        assert_eq!(
            h.manager.current_session().await,
            Some(SessionId::durable("s1"))
        );
    }

    #[tokio::test]
    async fn superseding_target_closes_and_finalizes_previous_session() {
        let h = harness(RetryConfig::default());
        let a = SessionId::durable("a");
        let b = SessionId::durable("b");
        h.store.set_displayed(Some(a.clone()));
        let live_a = h.transport.push_live();
        let live_b = h.transport.push_live();

        h.manager.sync_target(Some(&a), true).await;
        wait_open(&h.manager).await;
        live_a.send(Ok(delta("for a").into())).unwrap();
        tokio::task::yield_now().await;

        h.store.set_displayed(Some(b.clone()));
        h.manager.sync_target(Some(&b), true).await;
        wait_open(&h.manager).await;
        live_b.send(Ok(delta("for b").into())).unwrap();
        tokio::task::yield_now().await;

        // No cross-talk: each delta landed in its own session, and the
        // superseded session was finalized.
        let (messages_a, draft_a) = h.store.transcript(&a).unwrap();
        assert_eq!(messages_a.len(), 1);
        assert_eq!(messages_a[0].content, "for a");
        assert!(draft_a.is_empty());
        assert_eq!(h.store.run_status(&a), Some(RunStatus::Idle));

        let (messages_b, _) = h.store.transcript(&b).unwrap();
        assert_eq!(messages_b.len(), 1);
        assert_eq!(messages_b[0].content, "for b");
    }

    #[tokio::test]
    async fn background_completion_triggers_replay_reconciliation() {
        let h = harness(RetryConfig::default());
        let bg = SessionId::durable("bg");
        let fg = SessionId::durable("fg");
        h.store.set_displayed(Some(fg));
        h.api.set_replay(vec![
            Message::new("srv-1".into(), Role::User, "prompt"),
            Message::new("srv-2".into(), Role::Assistant, "full answer"),
        ]);
        h.transport.push_chunks([delta("partial"), stream_end(0)]);

        h.manager.sync_target(Some(&bg), true).await;
        wait_closed(&h.manager).await;
        // Reconciliation runs after the handle clears.
        tokio::task::yield_now().await;

        assert_eq!(h.api.replay_calls(), 1);
        let (messages, _) = h.store.transcript(&bg).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "full answer");
    }

    #[tokio::test]
    async fn final_partial_line_is_flushed_on_graceful_end() {
        let h = harness(RetryConfig::default());
        let id = SessionId::durable("s1");
        h.store.set_displayed(Some(id.clone()));
        // The last delta line has no trailing newline before the end event.
        h.transport.push_chunks([
            delta("first\\n"),
            "tail without newline".to_string(),
            format!("\n{}", stream_end(0)),
        ]);

        h.manager.sync_target(Some(&id), true).await;
        wait_closed(&h.manager).await;

        let (messages, _) = h.store.transcript(&id).unwrap();
        assert!(messages[0].content.contains("tail without newline"));
    }

    #[tokio::test]
    async fn closing_mid_stream_preserves_finalized_content() {
        // The reader must be fully stopped before finalize runs; a chunk
        // applied afterwards would replace the finalized trailing message
        // with just the straggler text.
        let h = harness(RetryConfig::default());
        let id = SessionId::durable("s1");
        h.store.set_displayed(Some(id.clone()));
        let live = h.transport.push_live();

        h.manager.sync_target(Some(&id), true).await;
        wait_open(&h.manager).await;
        live.send(Ok(delta("final answer").into())).unwrap();
        tokio::task::yield_now().await;

        h.manager.sync_target(None, false).await;
        // The reader is gone; a late chunk has nowhere to land.
        let _ = live.send(Ok(delta(" tail").into()));
        tokio::task::yield_now().await;

        let (messages, draft) = h.store.transcript(&id).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "final answer");
        assert!(draft.is_empty());
        assert_eq!(h.store.run_status(&id), Some(RunStatus::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_attempts_request_replay_skip() {
        // The first open streams normally; every retry must ask the
        // server not to re-deliver history the client already has.
        let h = harness(RetryConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            max_retries: 5,
        });
        let id = SessionId::durable("s1");
        h.transport
            .push_chunks_then_error([delta("kept")], TransportError::Stream("reset".into()));
        h.transport.push_failure(TransportError::Connect("refused".into()));
        let _live = h.transport.push_live();

        h.manager.sync_target(Some(&id), true).await;
        let mut rx = h.manager.watch_state();
        let mut seen_retry = false;
        rx.wait_for(|s| {
            if matches!(s, ConnState::Retrying(_)) {
                seen_retry = true;
            }
            seen_retry && *s == ConnState::Open
        })
        .await
        .unwrap();

        assert_eq!(h.transport.reconnect_flags(), vec![false, true, true]);
    }

    #[tokio::test]
    async fn sync_target_not_running_closes_connection() {
        let h = harness(RetryConfig::default());
        let id = SessionId::durable("s1");
        let _live = h.transport.push_live();

        h.manager.sync_target(Some(&id), true).await;
        wait_open(&h.manager).await;

        h.manager.sync_target(Some(&id), false).await;
        assert_eq!(h.manager.state(), ConnState::Closed);
        assert!(h.manager.current_session().await.is_none());
    }
}

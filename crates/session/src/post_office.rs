//! Request/response correlation over a shared, multiplexed connection.
//!
//! Every outbound task gets a fresh [`CorrelationId`] and a pending entry with
//! a deadline. Inbound responses are matched purely by id, in any order.
//! Entries leave the table exactly once: on the matching reply, on expiry,
//! or when the connection is lost.

use browserlink_core::{CorrelationId, Error, Message, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::transport::{InboundFrame, TransportSender};

const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// An in-flight request awaiting its reply.
#[derive(Debug)]
pub struct PendingRequest {
    pub id: CorrelationId,
    pub created_at: Instant,
    pub deadline: Instant,
    completion: oneshot::Sender<Result<Message>>,
}

impl PendingRequest {
    fn resolve(self, outcome: Result<Message>) {
        // The waiter may have given up already; nothing to do then.
        let _ = self.completion.send(outcome);
    }
}

#[derive(Default)]
struct PendingTable {
    entries: HashMap<CorrelationId, PendingRequest>,
    /// Set once the connection is gone; later submits fail immediately.
    closed: Option<String>,
}

pub struct PostOffice {
    outbox: TransportSender,
    table: Mutex<PendingTable>,
    unsolicited: Option<mpsc::Sender<Message>>,
    late_replies: AtomicU64,
}

impl PostOffice {
    pub fn new(outbox: TransportSender) -> Self {
        Self {
            outbox,
            table: Mutex::new(PendingTable::default()),
            unsolicited: None,
            late_replies: AtomicU64::new(0),
        }
    }

    /// Also forward inbound tasks, logs and events to `listener`.
    pub fn with_unsolicited(outbox: TransportSender, listener: mpsc::Sender<Message>) -> Self {
        Self {
            unsolicited: Some(listener),
            ..Self::new(outbox)
        }
    }

    /// Send the message produced by `build` and wait for the reply carrying
    /// the same correlation id.
    ///
    /// `build` receives the freshly registered id and must embed it in the
    /// message. Fails with `Timeout` once `timeout` has elapsed without a
    /// reply, or with `ConnectionLost` if the channel drops first.
    pub async fn submit<F>(&self, build: F, timeout: Duration) -> Result<Message>
    where
        F: FnOnce(CorrelationId) -> Message,
    {
        let created_at = Instant::now();
        let deadline = deadline_after(created_at, timeout);
        let (tx, rx) = oneshot::channel();

        let id = {
            let mut table = self.table.lock().await;
            if let Some(reason) = &table.closed {
                return Err(Error::ConnectionLost(reason.clone()));
            }
            let mut id = CorrelationId::new();
            while table.entries.contains_key(&id) {
                id = CorrelationId::new();
            }
            table.entries.insert(
                id.clone(),
                PendingRequest {
                    id: id.clone(),
                    created_at,
                    deadline,
                    completion: tx,
                },
            );
            id
        };

        let msg = build(id.clone());
        if msg.correlation_id() != Some(&id) {
            self.forget(&id).await;
            return Err(Error::Protocol(format!(
                "{} message built for request {} does not carry its id",
                msg.kind(),
                id
            )));
        }

        if let Err(e) = self.outbox.send(&msg).await {
            self.forget(&id).await;
            return Err(e);
        }
        debug!(id = %id, timeout_ms = timeout.as_millis() as u64, "Request submitted");

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::ConnectionLost("post office dropped".to_string())),
            Err(_) => {
                self.forget(&id).await;
                debug!(id = %id, "Request timed out");
                Err(Error::Timeout(format!(
                    "request {} got no reply within {:?}",
                    id, timeout
                )))
            }
        }
    }

    /// Entry point for whatever the transport yields.
    pub async fn on_inbound_frame(&self, frame: InboundFrame) {
        match frame {
            Ok(msg) => self.on_inbound_message(msg).await,
            Err(e) => warn!(error = %e, "Discarding malformed inbound message"),
        }
    }

    pub async fn on_inbound_message(&self, msg: Message) {
        match msg {
            Message::Response(response) => {
                let id = response.id.clone();
                let entry = self.table.lock().await.entries.remove(&id);
                match entry {
                    Some(pending) => {
                        trace!(
                            id = %id,
                            elapsed_ms = pending.created_at.elapsed().as_millis() as u64,
                            "Response matched"
                        );
                        pending.resolve(Ok(Message::Response(response)));
                    }
                    None => {
                        self.late_replies.fetch_add(1, Ordering::Relaxed);
                        debug!(id = %id, "Discarding response with no pending request");
                    }
                }
            }
            msg @ (Message::Task(_) | Message::Log(_) | Message::Event(_)) => self.forward(msg),
        }
    }

    fn forward(&self, msg: Message) {
        match &self.unsolicited {
            Some(listener) => {
                if let Err(e) = listener.try_send(msg) {
                    warn!(error = %e, "Unsolicited message listener full or gone, dropping");
                }
            }
            None => trace!(kind = %msg.kind(), "No listener for unsolicited message"),
        }
    }

    /// Fail every entry whose deadline is at or before `now` with `Timeout`.
    pub async fn expire(&self, now: Instant) -> usize {
        let expired: Vec<PendingRequest> = {
            let mut table = self.table.lock().await;
            let ids: Vec<CorrelationId> = table
                .entries
                .values()
                .filter(|p| p.deadline <= now)
                .map(|p| p.id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| table.entries.remove(id))
                .collect()
        };

        let count = expired.len();
        for pending in expired {
            let waited = now.saturating_duration_since(pending.created_at);
            let msg = format!("request {} got no reply within {:?}", pending.id, waited);
            pending.resolve(Err(Error::Timeout(msg)));
        }
        count
    }

    /// Fail every pending entry with `ConnectionLost` and clear the table.
    pub async fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut table = self.table.lock().await;
            table.entries.drain().map(|(_, p)| p).collect()
        };
        let count = drained.len();
        for pending in drained {
            pending.resolve(Err(Error::ConnectionLost(reason.to_string())));
        }
        count
    }

    /// Mark the post office as disconnected and fail everything in flight.
    pub async fn shutdown(&self, reason: &str) -> usize {
        self.table.lock().await.closed = Some(reason.to_string());
        self.fail_all(reason).await
    }

    /// Drive the post office from the transport's inbound sequence, sweeping
    /// expired entries every `tick`. Returns when the sequence ends.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<InboundFrame>, tick: Duration) {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(frame) => self.on_inbound_frame(frame).await,
                    None => {
                        let failed = self.shutdown("connection closed").await;
                        info!(failed, "Inbound stream ended, pending requests failed");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    let expired = self.expire(Instant::now()).await;
                    if expired > 0 {
                        debug!(expired, "Expired pending requests");
                    }
                }
            }
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.table.lock().await.entries.len()
    }

    pub async fn is_closed(&self) -> bool {
        self.table.lock().await.closed.is_some()
    }

    /// Responses that arrived with no matching pending request.
    pub fn late_replies(&self) -> u64 {
        self.late_replies.load(Ordering::Relaxed)
    }

    async fn forget(&self, id: &CorrelationId) {
        self.table.lock().await.entries.remove(id);
    }
}

/// `start + timeout`, saturating to roughly thirty years for huge timeouts.
fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start
        .checked_add(timeout)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::CommandEncoder;
    use serde_json::json;

    fn post_office() -> (Arc<PostOffice>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(64);
        (Arc::new(PostOffice::new(TransportSender::new(tx))), rx)
    }

    async fn sent_message(outbound: &mut mpsc::Receiver<String>) -> Message {
        let text = outbound.recv().await.expect("nothing was sent");
        Message::decode(&text).unwrap()
    }

    async fn sent_id(outbound: &mut mpsc::Receiver<String>) -> CorrelationId {
        sent_message(outbound).await.correlation_id().unwrap().clone()
    }

    fn spawn_task(
        po: &Arc<PostOffice>,
        task: &str,
        timeout: Duration,
    ) -> tokio::task::JoinHandle<Result<Message>> {
        let po = po.clone();
        let task = task.to_string();
        tokio::spawn(async move {
            po.submit(|id| Message::task(id, Some("user"), json!(task)), timeout)
                .await
        })
    }

    #[tokio::test]
    async fn test_response_resolves_exactly_once() {
        let (po, mut outbound) = post_office();
        let handle = spawn_task(&po, "hello", Duration::from_secs(5));
        let id = sent_id(&mut outbound).await;
        assert_eq!(po.pending_count().await, 1);

        po.on_inbound_message(Message::response(id.clone(), json!("first")))
            .await;
        po.on_inbound_message(Message::response(id.clone(), json!("second")))
            .await;

        let reply = handle.await.unwrap().unwrap();
        match reply {
            Message::Response(r) => assert_eq!(r.result, Some(json!("first"))),
            other => panic!("unexpected reply: {:?}", other),
        }
        assert_eq!(po.pending_count().await, 0);
        assert_eq!(po.late_replies(), 1);
    }

    #[tokio::test]
    async fn test_unmatched_response_leaves_others_pending() {
        let (po, mut outbound) = post_office();
        let handle = spawn_task(&po, "hello", Duration::from_secs(5));
        let id = sent_id(&mut outbound).await;

        po.on_inbound_message(Message::response("never-sent".into(), json!(1)))
            .await;
        assert_eq!(po.pending_count().await, 1);
        assert_eq!(po.late_replies(), 1);

        po.on_inbound_message(Message::response(id, json!(2))).await;
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_never_fires_early() {
        let (po, mut outbound) = post_office();
        let timeout = Duration::from_secs(3);
        let started = Instant::now();
        let handle = spawn_task(&po, "slow", timeout);
        let id = sent_id(&mut outbound).await;

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(started.elapsed() >= timeout);
        assert_eq!(po.pending_count().await, 0);

        // A reply after expiry is discarded as unmatched.
        po.on_inbound_message(Message::response(id, json!("late"))).await;
        assert_eq!(po.late_replies(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_timeout_waits_for_reply() {
        let (po, mut outbound) = post_office();
        let handle = spawn_task(&po, "patient", Duration::MAX);
        let id = sent_id(&mut outbound).await;

        tokio::time::advance(Duration::from_secs(86400 * 365)).await;
        assert_eq!(po.expire(Instant::now()).await, 0);
        assert!(!handle.is_finished());
        assert_eq!(po.pending_count().await, 1);

        po.on_inbound_message(Message::response(id, json!("done"))).await;
        let reply = handle.await.unwrap().unwrap();
        assert!(matches!(reply, Message::Response(_)));
    }

    #[test]
    fn test_deadline_saturates_on_overflow() {
        let start = Instant::now();
        assert_eq!(
            deadline_after(start, Duration::from_secs(3)),
            start + Duration::from_secs(3)
        );
        assert_eq!(deadline_after(start, Duration::MAX), start + FAR_FUTURE);
    }

    #[tokio::test]
    async fn test_out_of_order_replies_reach_their_own_callers() {
        let (po, mut outbound) = post_office();
        let mut handles = Vec::new();
        let mut ids = Vec::new();
        for n in 0..4u64 {
            handles.push(spawn_task(&po, &format!("task-{}", n), Duration::from_secs(10 + n)));
            let msg = sent_message(&mut outbound).await;
            match msg {
                Message::Task(t) => {
                    assert_eq!(t.task, json!(format!("task-{}", n)));
                    ids.push(t.id);
                }
                other => panic!("unexpected outbound: {:?}", other),
            }
        }

        for (n, id) in ids.iter().enumerate().rev() {
            po.on_inbound_message(Message::response(id.clone(), json!(n)))
                .await;
        }

        for (n, handle) in handles.into_iter().enumerate() {
            match handle.await.unwrap().unwrap() {
                Message::Response(r) => {
                    assert_eq!(r.id, ids[n]);
                    assert_eq!(r.result, Some(json!(n)));
                }
                other => panic!("unexpected reply: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_expire_sweeps_only_overdue_entries() {
        let (po, mut outbound) = post_office();
        let short = spawn_task(&po, "short", Duration::from_secs(10));
        sent_id(&mut outbound).await;
        let long = spawn_task(&po, "long", Duration::from_secs(60));
        let long_id = sent_id(&mut outbound).await;

        assert_eq!(po.expire(Instant::now()).await, 0);
        assert_eq!(po.expire(Instant::now() + Duration::from_secs(11)).await, 1);

        assert!(matches!(short.await.unwrap(), Err(Error::Timeout(_))));
        assert_eq!(po.pending_count().await, 1);

        po.on_inbound_message(Message::response(long_id, json!("ok"))).await;
        assert!(long.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_fail_all_broadcasts_connection_lost() {
        let (po, mut outbound) = post_office();
        let a = spawn_task(&po, "a", Duration::from_secs(30));
        sent_id(&mut outbound).await;
        let b = spawn_task(&po, "b", Duration::from_secs(30));
        sent_id(&mut outbound).await;

        assert_eq!(po.fail_all("socket reset").await, 2);
        for handle in [a, b] {
            match handle.await.unwrap() {
                Err(Error::ConnectionLost(reason)) => assert_eq!(reason, "socket reset"),
                other => panic!("unexpected: {:?}", other),
            }
        }
        assert_eq!(po.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_run_loop_handles_stream_end() {
        let (po, mut outbound) = post_office();
        let (in_tx, in_rx) = mpsc::channel(8);
        let driver = tokio::spawn(po.clone().run(in_rx, Duration::from_millis(50)));

        let pending = spawn_task(&po, "orphan", Duration::from_secs(30));
        sent_id(&mut outbound).await;

        in_tx
            .send(Err(Error::Protocol("missing field `id`".to_string())))
            .await
            .unwrap();
        drop(in_tx);
        driver.await.unwrap();

        assert!(matches!(pending.await.unwrap(), Err(Error::ConnectionLost(_))));
        assert!(po.is_closed().await);

        let err = po
            .submit(|id| Message::task(id, None, json!("after")), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionLost(_)));
    }

    #[tokio::test]
    async fn test_unsolicited_messages_are_forwarded() {
        let (tx, _outbound) = mpsc::channel(8);
        let (listener_tx, mut listener_rx) = mpsc::channel(8);
        let po = PostOffice::with_unsolicited(TransportSender::new(tx), listener_tx);

        po.on_inbound_message(Message::log(Some("system"), "info", json!("welcome")))
            .await;
        let forwarded = listener_rx.recv().await.unwrap();
        assert_eq!(forwarded.role(), Some("system"));
        assert_eq!(po.late_replies(), 0);
    }

    #[tokio::test]
    async fn test_builder_must_embed_id() {
        let (po, _outbound) = post_office();
        let err = po
            .submit(
                |_| Message::task("someone-else".into(), None, json!("x")),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(po.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_send_failure_removes_entry() {
        let (po, outbound) = post_office();
        drop(outbound);
        let err = po
            .submit(|id| Message::task(id, None, json!("x")), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransportClosed));
        assert_eq!(po.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_script_round_trip_within_window() {
        let (po, mut outbound) = post_office();
        let handle = {
            let po = po.clone();
            tokio::spawn(async move {
                po.submit(
                    |id| CommandEncoder::script_task(id, "return 1+1"),
                    Duration::from_secs(5),
                )
                .await
            })
        };

        let task = match sent_message(&mut outbound).await {
            Message::Task(t) => t,
            other => panic!("unexpected outbound: {:?}", other),
        };
        let directive = task.task.as_str().unwrap();
        assert!(directive.starts_with("[CMD:BROWSER_JS] "));
        assert_eq!(CommandEncoder::decode(directive).unwrap(), "return 1+1");

        let reply = Message::decode(&format!(
            r#"{{"type":"response","id":"{}","result":2}}"#,
            task.id
        ))
        .unwrap();
        po.on_inbound_frame(Ok(reply)).await;

        match handle.await.unwrap().unwrap() {
            Message::Response(r) => assert_eq!(r.into_result().unwrap(), json!(2)),
            other => panic!("unexpected reply: {:?}", other),
        }
    }
}

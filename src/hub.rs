//! DocumentHub: the single serialization point for one document.
//!
//! All state-changing operations on a document pass through one logical
//! writer task; concurrent clients are queued on a bounded inbound channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{HubError, HubResult};
use crate::operation::Operation;
use crate::protocol::{OperationRequest, RejectedOp, ServerMessage, UserSnapshot};
use crate::session::Session;
use crate::store::OperationStore;
use crate::history::History;

/// Hub lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    New,
    Active,
    Draining,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub current_version: u64,
    pub snapshot_text: String,
    pub active_users: Vec<UserSnapshot>,
}

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub current_version: u64,
    pub operations_since: Vec<Operation>,
    pub active_users: Vec<UserSnapshot>,
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub batch_id: Uuid,
    pub accepted: Vec<Operation>,
    pub rejected: Vec<RejectedOp>,
    pub final_version: u64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct HubStats {
    pub total_operations: u64,
    pub active_users: usize,
    pub last_activity: Option<DateTime<Utc>>,
    pub most_active_user: Option<Uuid>,
}

enum HubCommand {
    Join {
        session: Session,
        outbound: mpsc::Sender<ServerMessage>,
        reply: oneshot::Sender<JoinOutcome>,
    },
    Leave {
        session_id: Uuid,
    },
    Submit {
        author: Uuid,
        op: OperationRequest,
        base_version: u64,
        reply: oneshot::Sender<HubResult<Vec<Operation>>>,
    },
    SubmitBatch {
        author: Uuid,
        ops: Vec<OperationRequest>,
        base_version: u64,
        reply: oneshot::Sender<BatchOutcome>,
    },
    Sync {
        known_version: u64,
        reply: oneshot::Sender<HubResult<SyncOutcome>>,
    },
    UpdatePresence {
        session_id: Uuid,
        position: u64,
        selection_start: u64,
        selection_end: u64,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
}

struct Subscriber {
    user_id: Uuid,
    presence: UserSnapshot,
    outbound: mpsc::Sender<ServerMessage>,
    total_ops: u64,
    last_activity: DateTime<Utc>,
}

/// A handle to a running Hub. Cheap to clone; every clone shares the same
/// worker task and inbound queue.
#[derive(Clone)]
pub struct Hub {
    pub document_id: Uuid,
    command_tx: mpsc::Sender<HubCommand>,
}

impl Hub {
    /// Spawn a new Hub for `document_id`, seeding its history from
    /// `initial_ops` (persisted operations replayed onto `initial_text`, as
    /// on crash recovery — S6).
    pub fn spawn(
        document_id: Uuid,
        initial_text: String,
        initial_ops: Vec<Operation>,
        store: Arc<dyn OperationStore>,
        inbound_capacity: usize,
        retention_window: u64,
        idle_grace: Duration,
    ) -> (Self, tokio::task::JoinHandle<Uuid>) {
        let (command_tx, command_rx) = mpsc::channel(inbound_capacity);
        let history = History::from_operations(initial_ops, retention_window);

        let worker = HubWorker {
            document_id,
            history,
            text: initial_text,
            subscribers: HashMap::new(),
            state: HubState::New,
            store,
            idle_grace,
            draining_since: None,
        };

        let handle = tokio::spawn(worker.run(command_rx));

        (
            Hub {
                document_id,
                command_tx,
            },
            handle,
        )
    }

    pub async fn join(&self, session: Session, outbound: mpsc::Sender<ServerMessage>) -> HubResult<JoinOutcome> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .try_send(HubCommand::Join {
                session,
                outbound,
                reply: reply_tx,
            })
            .map_err(|_| HubError::Overloaded)?;
        reply_rx.await.map_err(|_| HubError::Terminated)
    }

    pub fn leave(&self, session_id: Uuid) {
        let _ = self.command_tx.try_send(HubCommand::Leave { session_id });
    }

    /// Submit one operation. May return more than one accepted `Operation`
    /// when a concurrent insert split the submitted delete's range.
    pub async fn submit(
        &self,
        author: Uuid,
        op: OperationRequest,
        base_version: u64,
    ) -> HubResult<Vec<Operation>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .try_send(HubCommand::Submit {
                author,
                op,
                base_version,
                reply: reply_tx,
            })
            .map_err(|_| HubError::Overloaded)?;
        reply_rx.await.map_err(|_| HubError::Terminated)?
    }

    pub async fn submit_batch(
        &self,
        author: Uuid,
        ops: Vec<OperationRequest>,
        base_version: u64,
    ) -> HubResult<BatchOutcome> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .try_send(HubCommand::SubmitBatch {
                author,
                ops,
                base_version,
                reply: reply_tx,
            })
            .map_err(|_| HubError::Overloaded)?;
        reply_rx.await.map_err(|_| HubError::Terminated)
    }

    pub async fn sync(&self, known_version: u64) -> HubResult<SyncOutcome> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .try_send(HubCommand::Sync {
                known_version,
                reply: reply_tx,
            })
            .map_err(|_| HubError::Overloaded)?;
        reply_rx.await.map_err(|_| HubError::Terminated)?
    }

    pub fn update_presence(&self, session_id: Uuid, position: u64, selection_start: u64, selection_end: u64) {
        let _ = self.command_tx.try_send(HubCommand::UpdatePresence {
            session_id,
            position,
            selection_start,
            selection_end,
        });
    }

    pub async fn stats(&self) -> HubResult<HubStats> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .try_send(HubCommand::Stats { reply: reply_tx })
            .map_err(|_| HubError::Overloaded)?;
        reply_rx.await.map_err(|_| HubError::Terminated)
    }
}

struct HubWorker {
    document_id: Uuid,
    history: History,
    text: String,
    subscribers: HashMap<Uuid, Subscriber>,
    state: HubState,
    store: Arc<dyn OperationStore>,
    idle_grace: Duration,
    draining_since: Option<Instant>,
}

impl HubWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<HubCommand>) -> Uuid {
        loop {
            let next = match self.draining_since {
                Some(started) => {
                    let deadline = started + self.idle_grace;
                    tokio::select! {
                        cmd = rx.recv() => cmd,
                        _ = tokio::time::sleep_until(deadline) => {
                            self.state = HubState::Terminated;
                            None
                        }
                    }
                }
                None => rx.recv().await,
            };

            match next {
                Some(cmd) => self.handle(cmd).await,
                None => break,
            }

            if self.state == HubState::Terminated {
                break;
            }
        }
        self.document_id
    }

    async fn handle(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Join { session, outbound, reply } => {
                let outcome = self.handle_join(session, outbound);
                let _ = reply.send(outcome);
            }
            HubCommand::Leave { session_id } => {
                self.handle_leave(session_id);
            }
            HubCommand::Submit { author, op, base_version, reply } => {
                let result = self.handle_submit(author, op, base_version).await;
                let _ = reply.send(result);
            }
            HubCommand::SubmitBatch { author, ops, base_version, reply } => {
                let outcome = self.handle_submit_batch(author, ops, base_version).await;
                let _ = reply.send(outcome);
            }
            HubCommand::Sync { known_version, reply } => {
                let result = self.handle_sync(known_version);
                let _ = reply.send(result);
            }
            HubCommand::UpdatePresence { session_id, position, selection_start, selection_end } => {
                self.handle_update_presence(session_id, position, selection_start, selection_end);
            }
            HubCommand::Stats { reply } => {
                let _ = reply.send(self.handle_stats());
            }
        }
    }

    fn handle_join(&mut self, session: Session, outbound: mpsc::Sender<ServerMessage>) -> JoinOutcome {
        self.state = HubState::Active;
        self.draining_since = None;

        let presence = UserSnapshot::from(&session);
        self.subscribers.insert(
            session.session_id,
            Subscriber {
                user_id: session.user_id,
                presence: presence.clone(),
                outbound,
                total_ops: 0,
                last_activity: Utc::now(),
            },
        );

        let active_users = self.active_users();
        self.broadcast(
            ServerMessage::UserJoined {
                user_id: session.user_id,
                active_users: active_users.clone(),
            },
            Some(session.session_id),
        );

        JoinOutcome {
            current_version: self.history.current_version(),
            snapshot_text: self.text.clone(),
            active_users,
        }
    }

    fn handle_leave(&mut self, session_id: Uuid) {
        if let Some(subscriber) = self.subscribers.remove(&session_id) {
            let active_users = self.active_users();
            self.broadcast(
                ServerMessage::UserLeft {
                    user_id: subscriber.user_id,
                    active_users,
                },
                None,
            );
        }

        if self.subscribers.is_empty() && self.state != HubState::Terminated {
            self.state = HubState::Draining;
            self.draining_since = Some(Instant::now());
        }
    }

    async fn handle_submit(
        &mut self,
        author: Uuid,
        op: OperationRequest,
        base_version: u64,
    ) -> HubResult<Vec<Operation>> {
        if self.history.is_stale(base_version) {
            return Err(HubError::StaleBase {
                base_version,
                floor: self.history.retained_floor(),
            });
        }

        let pending = op.into_operation(author, base_version);
        let accepted = self.accept_fragments(vec![pending], base_version).await?;

        for op in &accepted {
            self.broadcast(
                ServerMessage::Operation { operation: op.clone() },
                Some(self.session_id_for(author)),
            );
        }

        Ok(accepted)
    }

    async fn handle_submit_batch(
        &mut self,
        author: Uuid,
        ops: Vec<OperationRequest>,
        base_version: u64,
    ) -> BatchOutcome {
        let batch_id = Uuid::new_v4();

        if self.history.is_stale(base_version) {
            let rejected = (0..ops.len())
                .map(|index| RejectedOp {
                    index,
                    reason: "STALE_BASE".to_string(),
                })
                .collect();
            return BatchOutcome {
                batch_id,
                accepted: Vec::new(),
                rejected,
                final_version: self.history.current_version(),
            };
        }

        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        let mut batch_so_far: Vec<Operation> = Vec::new();

        for (index, op) in ops.into_iter().enumerate() {
            let mut pending_fragments = vec![op.into_operation(author, base_version)];

            // Transform against earlier members of this same batch first,
            // then against intervening history. A prior member can split a
            // pending delete into two fragments; each must keep folding
            // through the remaining batch members independently rather than
            // discarding all but the first.
            for prior in &batch_so_far {
                let mut next = Vec::with_capacity(pending_fragments.len());
                for candidate in &pending_fragments {
                    next.extend(crate::operation::transform(candidate, prior));
                }
                pending_fragments = next;
            }

            match self.accept_fragments(pending_fragments.clone(), base_version).await {
                Ok(fragments) => {
                    batch_so_far.extend(pending_fragments);
                    accepted.extend(fragments);
                }
                Err(err) => rejected.push(RejectedOp {
                    index,
                    reason: err.to_string(),
                }),
            }
        }

        for op in &accepted {
            self.broadcast(
                ServerMessage::Operation { operation: op.clone() },
                Some(self.session_id_for(author)),
            );
        }

        BatchOutcome {
            batch_id,
            accepted,
            rejected,
            final_version: self.history.current_version(),
        }
    }

    /// Transform `pending` through intervening history, clip to invariants,
    /// append, and persist. Shared by both single submits and batch members.
    async fn accept_fragments(
        &mut self,
        pending: Vec<Operation>,
        base_version: u64,
    ) -> HubResult<Vec<Operation>> {
        let mut accepted = Vec::new();

        for op in pending {
            let mut fragments = self.history.transform_against_new(op, base_version);
            // Fragments produced by a single delete-over-insert split share one
            // coordinate frame computed before any of them is applied. Applying
            // the rightmost one first leaves the earlier fragments' positions
            // valid for the text as it shrinks; left-to-right would stale them.
            fragments.sort_by(|a, b| b.position.cmp(&a.position));
            for fragment in fragments {
                let text_len = self.text.chars().count() as u64;
                let clipped = fragment.clipped(text_len);

                let new_text = clipped
                    .apply(&self.text)
                    .map_err(HubError::Ot)?;

                let appended = self.history.append(clipped);
                self.store
                    .append(self.document_id, &appended)
                    .await
                    .map_err(HubError::Store)?;

                self.text = new_text;
                accepted.push(appended);
            }
        }

        Ok(accepted)
    }

    fn handle_sync(&self, known_version: u64) -> HubResult<SyncOutcome> {
        if self.history.is_stale(known_version) {
            return Err(HubError::StaleBase {
                base_version: known_version,
                floor: self.history.retained_floor(),
            });
        }

        Ok(SyncOutcome {
            current_version: self.history.current_version(),
            operations_since: self.history.since(known_version),
            active_users: self.active_users(),
        })
    }

    fn handle_update_presence(&mut self, session_id: Uuid, position: u64, selection_start: u64, selection_end: u64) {
        let user_id = match self.subscribers.get_mut(&session_id) {
            Some(subscriber) => {
                subscriber.presence.cursor_position = position;
                subscriber.presence.selection_start = selection_start.min(selection_end);
                subscriber.presence.selection_end = selection_start.max(selection_end);
                subscriber.last_activity = Utc::now();
                subscriber.user_id
            }
            None => return,
        };

        let color = self.subscribers.get(&session_id).unwrap().presence.color;
        self.broadcast(
            ServerMessage::Presence {
                user_id,
                color,
                cursor_position: position,
                selection_start,
                selection_end,
            },
            Some(session_id),
        );
    }

    fn handle_stats(&self) -> HubStats {
        let most_active_user = self
            .subscribers
            .values()
            .max_by_key(|s| s.last_activity)
            .map(|s| s.user_id);
        let last_activity = self.subscribers.values().map(|s| s.last_activity).max();

        HubStats {
            total_operations: self.history.current_version(),
            active_users: self.subscribers.len(),
            last_activity,
            most_active_user,
        }
    }

    fn active_users(&self) -> Vec<UserSnapshot> {
        self.subscribers.values().map(|s| s.presence.clone()).collect()
    }

    /// Best-effort lookup used only to exclude the author's own session from
    /// a broadcast; returns a nil id (matching nothing) if not found, which
    /// just means the author also receives their own echo.
    fn session_id_for(&self, author: Uuid) -> Uuid {
        self.subscribers
            .iter()
            .find(|(_, s)| s.user_id == author)
            .map(|(id, _)| *id)
            .unwrap_or_else(Uuid::nil)
    }

    /// Fan out `msg` to every subscriber except `except`. A subscriber whose
    /// outbound channel is full is dropped rather than blocking the Hub; it
    /// will resync on reconnect.
    fn broadcast(&mut self, msg: ServerMessage, except: Option<Uuid>) {
        let mut disconnect = Vec::new();

        for (session_id, subscriber) in self.subscribers.iter_mut() {
            if Some(*session_id) == except {
                continue;
            }
            subscriber.total_ops += 1;
            if subscriber.outbound.try_send(msg.clone()).is_err() {
                disconnect.push(*session_id);
            }
        }

        for session_id in disconnect {
            if let Some(subscriber) = self.subscribers.remove(&session_id) {
                // Don't recurse into broadcast for the synthetic departure;
                // a best-effort notice to remaining subscribers is enough.
                let active_users = self.active_users();
                for (_, other) in self.subscribers.iter() {
                    let _ = other.outbound.try_send(ServerMessage::UserLeft {
                        user_id: subscriber.user_id,
                        active_users: active_users.clone(),
                    });
                }
            }
        }

        if self.subscribers.is_empty() && self.state != HubState::Terminated {
            self.state = HubState::Draining;
            self.draining_since = Some(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WireOpType;
    use crate::store::SqliteOperationStore;

    async fn test_store() -> Arc<dyn OperationStore> {
        Arc::new(SqliteOperationStore::connect("sqlite::memory:").await.unwrap())
    }

    #[tokio::test]
    async fn join_then_submit_produces_accepted_operation() {
        let store = test_store().await;
        let document_id = Uuid::new_v4();
        let (hub, _handle) = Hub::spawn(document_id, String::new(), Vec::new(), store, 1024, 1000, Duration::from_secs(30));

        let author = Uuid::new_v4();
        let session = Session::new(document_id, author);
        let (outbound_tx, _outbound_rx) = mpsc::channel(64);
        let joined = hub.join(session, outbound_tx).await.unwrap();
        assert_eq!(joined.current_version, 0);

        let op = OperationRequest {
            op_type: WireOpType::Insert,
            position: 0,
            content: Some("hello".to_string()),
            length: None,
        };
        let accepted = hub.submit(author, op, 0).await.unwrap();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].version, 1);
    }

    #[tokio::test]
    async fn stale_base_is_rejected() {
        let store = test_store().await;
        let document_id = Uuid::new_v4();
        let (hub, _handle) = Hub::spawn(document_id, String::new(), Vec::new(), store, 1024, 5, Duration::from_secs(30));

        let author = Uuid::new_v4();
        for i in 0..10u64 {
            let op = OperationRequest {
                op_type: WireOpType::Insert,
                position: i,
                content: Some("x".to_string()),
                length: None,
            };
            hub.submit(author, op, i).await.ok();
        }

        let stale = OperationRequest {
            op_type: WireOpType::Insert,
            position: 0,
            content: Some("y".to_string()),
            length: None,
        };
        let result = hub.submit(author, stale, 0).await;
        assert!(matches!(result, Err(HubError::StaleBase { .. })));
    }
}

//! Table of calls awaiting a reply.
//!
//! Every resolution path (reply, caller deadline, sweep, disconnect) goes
//! through a remove on the table under one lock, so exactly one of them
//! delivers a result.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::{CallOutcome, Reply};
use crate::middleware::Locals;
use crate::packet::CorrelationId;

struct PendingCall {
    deadline: Instant,
    locals: Locals,
    reply_tx: oneshot::Sender<Reply>,
}

#[derive(Default)]
struct State {
    calls: HashMap<CorrelationId, PendingCall>,
    deadlines: BinaryHeap<Reverse<(Instant, CorrelationId)>>,
}

#[derive(Default)]
pub(crate) struct PendingCalls {
    state: Mutex<State>,
}

impl PendingCalls {
    /// Register a call and return the receiver its resolution arrives on.
    pub(crate) fn insert(
        &self,
        id: CorrelationId,
        deadline: Instant,
        locals: Locals,
    ) -> oneshot::Receiver<Reply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let mut state = self.state.lock();
        state.deadlines.push(Reverse((deadline, id.clone())));
        state.calls.insert(
            id,
            PendingCall {
                deadline,
                locals,
                reply_tx,
            },
        );
        reply_rx
    }

    /// Side-channel values of a pending call.
    pub(crate) fn locals(&self, id: &CorrelationId) -> Option<Locals> {
        self.state.lock().calls.get(id).map(|call| call.locals.clone())
    }

    /// Resolve a call if it is still pending. Returns whether this resolution won.
    pub(crate) fn resolve(&self, id: &CorrelationId, reply: Reply) -> bool {
        let call = self.state.lock().calls.remove(id);
        call.is_some_and(|call| {
            // The caller may have stopped waiting; the entry is gone either way.
            let _ = call.reply_tx.send(reply);
            true
        })
    }

    /// Resolve every call whose deadline is at or before `now` as timed out.
    pub(crate) fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<PendingCall> = {
            let mut state = self.state.lock();
            let mut expired = Vec::new();

            while let Some(Reverse((deadline, _))) = state.deadlines.peek() {
                if *deadline > now {
                    break;
                }
                let Some(Reverse((deadline, id))) = state.deadlines.pop() else {
                    break;
                };
                // Calls resolved earlier leave a stale heap entry behind.
                if state
                    .calls
                    .get(&id)
                    .is_some_and(|call| call.deadline == deadline)
                {
                    if let Some(call) = state.calls.remove(&id) {
                        expired.push(call);
                    }
                }
            }

            expired
        };

        let count = expired.len();
        for call in expired {
            let _ = call.reply_tx.send(Reply::empty(CallOutcome::TimedOut));
        }
        count
    }

    /// Resolve every pending call with `outcome`.
    pub(crate) fn fail_all(&self, outcome: CallOutcome) -> usize {
        let calls: Vec<PendingCall> = {
            let mut state = self.state.lock();
            state.deadlines.clear();
            state.calls.drain().map(|(_, call)| call).collect()
        };

        let count = calls.len();
        for call in calls {
            let _ = call.reply_tx.send(Reply::empty(outcome));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().calls.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn reply(value: i64) -> Reply {
        Reply {
            value: json!(value),
            meta: crate::packet::Meta::new(),
            outcome: CallOutcome::Replied,
        }
    }

    #[tokio::test]
    async fn test_first_resolution_wins() {
        let pending = PendingCalls::default();
        let id = CorrelationId::generate();
        let rx = pending.insert(id.clone(), Instant::now(), Locals::new());

        assert!(pending.resolve(&id, reply(1)));
        assert!(!pending.resolve(&id, reply(2)));
        assert_eq!(pending.sweep(Instant::now()), 0);

        let got = rx.await.unwrap();
        assert_eq!(got.value, json!(1));
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn test_sweep_only_expired() {
        let pending = PendingCalls::default();
        let now = Instant::now();
        let early = CorrelationId::generate();
        let late = CorrelationId::generate();

        let early_rx = pending.insert(early, now + Duration::from_millis(10), Locals::new());
        let _late_rx = pending.insert(late.clone(), now + Duration::from_secs(10), Locals::new());

        assert_eq!(pending.sweep(now), 0);
        assert_eq!(pending.sweep(now + Duration::from_millis(10)), 1);
        assert_eq!(pending.len(), 1);
        assert!(pending.locals(&late).is_some());

        let got = early_rx.await.unwrap();
        assert_eq!(got.outcome, CallOutcome::TimedOut);
        assert!(got.value.is_null());
    }

    #[tokio::test]
    async fn test_fail_all() {
        let pending = PendingCalls::default();
        let receivers: Vec<_> = (0..3)
            .map(|_| {
                pending.insert(
                    CorrelationId::generate(),
                    Instant::now() + Duration::from_secs(1),
                    Locals::new(),
                )
            })
            .collect();

        assert_eq!(pending.fail_all(CallOutcome::Disconnected), 3);
        for rx in receivers {
            assert_eq!(rx.await.unwrap().outcome, CallOutcome::Disconnected);
        }
        assert_eq!(pending.sweep(Instant::now() + Duration::from_secs(5)), 0);
    }
}

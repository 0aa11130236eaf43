//! # rpc
//!
//! why: stop a slow or lost peer from stalling elections and replication
//! relations: wraps transport.rs, used by election.rs and replication.rs
//! what: RpcGuard, a bounded wait around a single transport call

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::TransportError;
use crate::message::{NodeId, RaftMessage};
use crate::transport::Transport;

type CallResult = Result<RaftMessage, TransportError>;

// single-slot channel carrying the result of one attempt
struct Signal {
    tx: mpsc::Sender<CallResult>,
    rx: mpsc::Receiver<CallResult>,
}

impl Signal {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self { tx, rx }
    }
}

const MAX_POOLED_SIGNALS: usize = 64;

/// Issues calls through a [`Transport`] with a hard deadline.
///
/// Each call runs as a detached task that owns its request and its reply.
/// If the deadline passes first the caller gets [`TransportError::TimedOut`]
/// and the attempt is abandoned: whatever it later produces is dropped, but
/// the peer may still have acted on the request.
pub struct RpcGuard {
    transport: Arc<dyn Transport>,
    signals: Mutex<Vec<Signal>>,
}

impl RpcGuard {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            signals: Mutex::new(Vec::new()),
        }
    }

    /// Send `message` to `to` and wait at most `timeout` for the reply.
    pub async fn call(&self, to: NodeId, message: RaftMessage, timeout: Duration) -> CallResult {
        let mut signal = self.signals.lock().pop().unwrap_or_else(Signal::new);

        let transport = Arc::clone(&self.transport);
        let tx = signal.tx.clone();
        let method = message.method();
        tokio::spawn(async move {
            let result = transport.call(to, message).await;
            // receiver is gone when the caller already gave up
            let _ = tx.send(result).await;
        });

        // the signal's own sender keeps the channel open, so an attempt that
        // dies without reporting is only noticed when the deadline passes
        let outcome = tokio::time::timeout(timeout, signal.rx.recv()).await;
        if let Ok(Some(result)) = outcome {
            self.recycle(signal);
            return result;
        }
        trace!(peer = to, method, ?timeout, "call abandoned after timeout");
        Err(TransportError::TimedOut { to })
    }

    fn recycle(&self, signal: Signal) {
        let mut signals = self.signals.lock();
        if signals.len() < MAX_POOLED_SIGNALS {
            signals.push(signal);
        }
    }

    #[cfg(test)]
    fn pooled(&self) -> usize {
        self.signals.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{RequestVoteArgs, RequestVoteReply};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers every vote request after `delay`, echoing the term.
    struct SlowPeer {
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for SlowPeer {
        async fn call(&self, _to: NodeId, message: RaftMessage) -> CallResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            match message {
                RaftMessage::RequestVote(args) => Ok(RaftMessage::RequestVoteReply(RequestVoteReply {
                    term: args.term,
                    vote_granted: true,
                })),
                _ => Err(TransportError::UnexpectedReply),
            }
        }
    }

    fn vote(term: u64) -> RaftMessage {
        RaftMessage::RequestVote(RequestVoteArgs {
            term,
            candidate_id: 1,
            commit_index: 0,
        })
    }

    fn guard(delay: Duration) -> (RpcGuard, Arc<SlowPeer>) {
        let peer = Arc::new(SlowPeer {
            delay,
            calls: AtomicUsize::new(0),
        });
        (RpcGuard::new(peer.clone()), peer)
    }

    #[tokio::test]
    async fn fast_reply_is_returned_and_signal_reused() {
        let (guard, peer) = guard(Duration::from_millis(1));

        for term in 1..=3 {
            let reply = guard.call(2, vote(term), Duration::from_millis(500)).await.unwrap();
            assert_eq!(
                reply,
                RaftMessage::RequestVoteReply(RequestVoteReply {
                    term,
                    vote_granted: true
                })
            );
        }

        assert_eq!(peer.calls.load(Ordering::SeqCst), 3);
        assert_eq!(guard.pooled(), 1);
    }

    #[tokio::test]
    async fn slow_reply_times_out_without_waiting() {
        let (guard, _peer) = guard(Duration::from_millis(300));
        let started = tokio::time::Instant::now();

        let err = guard.call(2, vote(1), Duration::from_millis(10)).await.unwrap_err();

        assert_eq!(err, TransportError::TimedOut { to: 2 });
        assert!(started.elapsed() < Duration::from_millis(200));
        // the abandoned signal is never recycled
        assert_eq!(guard.pooled(), 0);
    }

    #[tokio::test]
    async fn late_result_never_reaches_a_later_call() {
        let (guard, _peer) = guard(Duration::from_millis(40));

        assert!(guard.call(2, vote(1), Duration::from_millis(5)).await.is_err());
        let reply = guard.call(2, vote(2), Duration::from_millis(500)).await.unwrap();

        match reply {
            RaftMessage::RequestVoteReply(r) => assert_eq!(r.term, 2),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    /// Panics inside every call, so no result is ever sent.
    struct PanickingPeer;

    #[async_trait]
    impl Transport for PanickingPeer {
        async fn call(&self, to: NodeId, _message: RaftMessage) -> CallResult {
            panic!("peer {to} crashed mid-call");
        }
    }

    #[tokio::test]
    async fn crashed_attempt_is_reported_as_timeout() {
        let guard = RpcGuard::new(Arc::new(PanickingPeer));

        let err = guard.call(3, vote(1), Duration::from_millis(20)).await.unwrap_err();

        assert_eq!(err, TransportError::TimedOut { to: 3 });
        assert_eq!(guard.pooled(), 0);
    }

    #[tokio::test]
    async fn transport_errors_pass_through() {
        let (guard, _peer) = guard(Duration::ZERO);
        let heartbeat = RaftMessage::AppendEntries(crate::message::AppendEntriesArgs::heartbeat(1, 1, 0));

        let err = guard.call(2, heartbeat, Duration::from_millis(100)).await.unwrap_err();

        assert_eq!(err, TransportError::UnexpectedReply);
    }
}

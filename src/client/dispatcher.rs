//! Operation dispatcher
//!
//! Drives one operation through `Created → Mapped → Sent → AwaitingResponse`
//! and on to `Completed`, `Retrying` or `Failed`. Each attempt maps the key
//! against whatever topology is current at that moment, so a retry after
//! NotMyVbucket lands on the new owner.

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use super::backoff::Backoff;
use super::cancel::CancelToken;
use crate::cluster::{ClusterNode, TopologyManager};
use crate::config::ClientConfig;
use crate::protocol::{Operation, OperationResult, RetryReason, Status, StatusClass};
use crate::utils::{ClusterError, ConnectionError, KvError, Result};

/// Result of a single attempt
enum Attempt {
    Completed(OperationResult),
    Retry(RetryReason),
    Failed(KvError),
}

/// Executes operations with retry and redirect handling
pub struct Dispatcher {
    topology: Arc<TopologyManager>,
    max_attempts: u32,
    backoff: Backoff,
    pool_wait: std::time::Duration,
}

impl Dispatcher {
    pub fn new(topology: Arc<TopologyManager>, config: &ClientConfig) -> Self {
        Self {
            topology,
            max_attempts: config.max_retry_attempts.max(1),
            backoff: config.backoff.clone(),
            pool_wait: config.pool.wait_timeout,
        }
    }

    pub fn topology(&self) -> &Arc<TopologyManager> {
        &self.topology
    }

    /// Run `op` to completion
    ///
    /// Application statuses (KeyNotFound, KeyExists, ...) come back as `Ok`.
    /// `Err` means the operation never got a usable answer: it timed out,
    /// ran out of attempts, was cancelled or hit a fatal error.
    pub fn execute(&self, op: &mut Operation, cancel: &CancelToken) -> Result<OperationResult> {
        loop {
            if cancel.is_cancelled() {
                return Err(KvError::Cancelled {
                    key: op.key_str(),
                    opcode: op.opcode,
                });
            }
            if op.is_expired() {
                return Err(timed_out(op));
            }
            if self.topology.is_closed() {
                return Err(ClusterError::Closed.into());
            }

            op.attempts += 1;
            debug!("{:?} '{}' created (attempt {})", op.opcode, op.key_str(), op.attempts);

            match self.attempt(op, cancel) {
                Attempt::Completed(result) => return Ok(result),
                Attempt::Failed(e) => {
                    debug!("{:?} '{}' failed on attempt {}: {}", op.opcode, op.key_str(), op.attempts, e);
                    return Err(e);
                }
                Attempt::Retry(reason) => {
                    op.record_retry(reason);
                    // running out of time outranks running out of attempts
                    if op.is_expired() {
                        return Err(timed_out(op));
                    }
                    if op.attempts >= self.max_attempts {
                        debug!(
                            "{:?} '{}' failed: {} attempts exhausted",
                            op.opcode,
                            op.key_str(),
                            op.attempts
                        );
                        return Err(KvError::RetriesExhausted {
                            key: op.key_str(),
                            opcode: op.opcode,
                            attempts: op.attempts,
                            last_reason: Some(reason),
                        });
                    }
                    let delay = self.backoff.delay_within(op.attempts, op.remaining());
                    debug!(
                        "{:?} '{}' retrying after {:?} ({:?}, attempt {})",
                        op.opcode,
                        op.key_str(),
                        delay,
                        reason,
                        op.attempts
                    );
                    if !cancel.sleep(delay) {
                        return Err(KvError::Cancelled {
                            key: op.key_str(),
                            opcode: op.opcode,
                        });
                    }
                }
            }
        }
    }

    fn attempt(&self, op: &mut Operation, cancel: &CancelToken) -> Attempt {
        let topology = self.topology.current();

        let node = if op.opcode.is_keyed() {
            match topology.route(&op.key, op.replica) {
                Ok((route, node)) => {
                    op.vbucket = route.vbucket;
                    node
                }
                // an unowned primary is mid-rebalance; an unset replica stays unset
                Err(ClusterError::UnassignedVbucket(vb)) if op.replica.is_none() => {
                    debug!("vBucket {} unassigned in revision {}", vb, topology.revision());
                    return self.retry(RetryReason::NodeUnavailable);
                }
                Err(e) => return Attempt::Failed(e.into()),
            }
        } else {
            match topology.any_node() {
                Ok(node) => node,
                Err(e) => return Attempt::Failed(e.into()),
            }
        };
        debug!(
            "{:?} '{}' mapped to {} (vb {:?}, rev {}, attempt {})",
            op.opcode,
            op.key_str(),
            node.endpoint(),
            op.vbucket,
            topology.revision(),
            op.attempts
        );

        let started = Instant::now();
        let mut conn = match node.pool().acquire(self.pool_wait.min(op.remaining())) {
            Ok(conn) => conn,
            Err(e) => return self.transport_failure(op, &node, e),
        };

        let opaque = conn.next_opaque();
        op.opaque = opaque;
        let frame = match op.encode(opaque) {
            Ok(frame) => frame,
            Err(e) => return Attempt::Failed(failed(op, &node, e.into())),
        };

        let deadline = op.deadline();
        if let Err(e) = conn.send(&frame, deadline) {
            return self.transport_failure(op, &node, e);
        }
        debug!("{:?} '{}' sent to {} (opaque {})", op.opcode, op.key_str(), node.endpoint(), opaque);

        debug!("{:?} '{}' awaiting response from {}", op.opcode, op.key_str(), node.endpoint());
        let response = match conn.receive(opaque, frame.header.opcode, deadline, Some(cancel)) {
            Ok(frame) => frame,
            Err(e) => return self.response_lost(op, &node, e),
        };
        drop(conn);

        let result = OperationResult::from_response(op.opcode, op.vbucket, response);
        match result.status.class() {
            StatusClass::Success | StatusClass::Application => {
                node.metrics().record_op(started.elapsed());
                node.mark_alive();
                if result.is_success() {
                    op.cas = result.cas;
                    op.mutation_token = result.mutation_token;
                }
                debug!(
                    "{:?} '{}' completed on {} with {} (attempt {})",
                    op.opcode,
                    op.key_str(),
                    node.endpoint(),
                    result.status,
                    op.attempts
                );
                Attempt::Completed(result)
            }
            StatusClass::Retry => {
                node.metrics().record_retry();
                let reason = RetryReason::from_status(result.status).unwrap_or(RetryReason::TemporaryFailure);
                // a map pushed with NotMyVbucket makes a fetch pointless
                if result.status == Status::NotMyVbucket
                    && !result.value.is_empty()
                    && self.topology.update_from_json(&result.value, node.host())
                {
                    return Attempt::Retry(reason);
                }
                self.retry(reason)
            }
            StatusClass::Fatal => {
                node.metrics().record_error();
                let e = ConnectionError::AuthFailed(result.status.to_string());
                Attempt::Failed(failed(op, &node, e.into()))
            }
        }
    }

    fn retry(&self, reason: RetryReason) -> Attempt {
        if reason.wants_config_refresh() {
            self.topology.request_refresh();
        }
        Attempt::Retry(reason)
    }

    /// The request was written but no answer arrived. Reads can simply go
    /// again; a mutation may already have been applied, so it must not.
    fn response_lost(&self, op: &Operation, node: &ClusterNode, e: KvError) -> Attempt {
        let unanswered = matches!(
            &e,
            KvError::Connection(
                ConnectionError::SocketTimeout(_)
                    | ConnectionError::DeadlineExceeded
                    | ConnectionError::Closed
                    | ConnectionError::Io(_)
            ) | KvError::Io(_)
        );
        if !unanswered || op.opcode.is_idempotent() {
            return self.transport_failure(op, node, e);
        }

        node.metrics().record_error();
        debug!(
            "{:?} '{}' failed on {}: {} after the request was sent (attempt {})",
            op.opcode,
            op.key_str(),
            node.endpoint(),
            e,
            op.attempts
        );
        Attempt::Failed(KvError::AmbiguousTimeout {
            key: op.key_str(),
            opcode: op.opcode,
            node: node.endpoint(),
            attempts: op.attempts,
            elapsed: op.created.elapsed(),
        })
    }

    fn transport_failure(&self, op: &Operation, node: &ClusterNode, e: KvError) -> Attempt {
        node.metrics().record_error();
        let reason = match &e {
            KvError::Connection(ConnectionError::Cancelled) => {
                return Attempt::Failed(KvError::Cancelled {
                    key: op.key_str(),
                    opcode: op.opcode,
                })
            }
            // the loop turns this into a timeout once it sees the deadline
            KvError::Connection(ConnectionError::DeadlineExceeded) => RetryReason::SocketTimeout,
            KvError::Connection(ConnectionError::ConnectFailed { .. }) => {
                node.mark_dead();
                RetryReason::ConnectFailed
            }
            KvError::Connection(ConnectionError::SocketTimeout(_)) => RetryReason::SocketTimeout,
            KvError::QueueTimeout { .. } => RetryReason::QueueFull,
            KvError::PoolShutdown(_) => RetryReason::NodeUnavailable,
            e if e.is_transient() => RetryReason::SocketClosed,
            _ => return Attempt::Failed(failed(op, node, e)),
        };
        debug!(
            "{:?} '{}' transport failure on {}: {} (attempt {})",
            op.opcode,
            op.key_str(),
            node.endpoint(),
            e,
            op.attempts
        );
        self.retry(reason)
    }
}

fn timed_out(op: &Operation) -> KvError {
    debug!(
        "{:?} '{}' failed: deadline passed after {} attempts",
        op.opcode,
        op.key_str(),
        op.attempts
    );
    KvError::Timeout {
        key: op.key_str(),
        opcode: op.opcode,
        attempts: op.attempts,
        elapsed: op.created.elapsed(),
        last_reason: op.last_retry_reason(),
    }
}

fn failed(op: &Operation, node: &ClusterNode, source: KvError) -> KvError {
    KvError::Operation {
        key: op.key_str(),
        opcode: op.opcode,
        node: node.endpoint(),
        attempts: op.attempts,
        source: Box::new(source),
    }
}

//! Wireless write queue driver.
//!
//! Pure state machine for the LE backend's serialized writes: FIFO order,
//! 50 ms minimum inter-write spacing, a 5 s confirmation timeout with up to
//! 3 retries at 100 ms backoff, and an urgent path that flushes the queue.
//! No I/O happens here; the backend feeds [`QueueEvent`]s and executes the
//! returned [`QueueAction`]s, re-entering at [`CommandQueue::next_deadline`]
//! for time-driven transitions.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use decenza_core::Environment;

use crate::EndpointId;

/// Minimum spacing between a write confirmation and the next submission.
pub const WRITE_SPACING: Duration = Duration::from_millis(50);
/// How long an unconfirmed write waits before it is retried.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Delay before a retry submission.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(100);
/// Retries before a write is dropped and the queue advances.
pub const MAX_WRITE_RETRIES: u8 = 3;

/// A queued write.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    /// Target endpoint.
    pub endpoint: EndpointId,
    /// Payload bytes.
    pub data: Bytes,
}

/// Events fed to the queue driver.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// A caller queued a write.
    Submit(PendingWrite),
    /// A caller requested an urgent write: flush, then write immediately.
    SubmitUrgent(PendingWrite),
    /// The host stack confirmed the in-flight write.
    WriteConfirmed,
    /// The host stack reported a write error for the in-flight write.
    WriteFailed,
    /// Time advanced to (at least) the deadline from `next_deadline`.
    Tick,
    /// Caller requested the queue be flushed without disconnecting.
    Clear,
    /// The link dropped; abandon everything.
    Disconnected,
}

/// Actions the backend must execute.
#[derive(Debug, Clone)]
pub enum QueueAction {
    /// Submit this write to the host stack.
    SubmitWrite(PendingWrite),
    /// Surface a completed write to transport subscribers.
    EmitWriteComplete(PendingWrite),
    /// A write exhausted its retries and was dropped.
    DropWrite(PendingWrite),
}

#[derive(Debug)]
struct InFlight {
    write: PendingWrite,
    retry_count: u8,
    /// When the current submission times out.
    timeout_at: Option<TimePoint>,
    /// When a scheduled retry should be submitted. While set, nothing is on
    /// the wire.
    retry_at: Option<TimePoint>,
}

type TimePoint = Duration;

/// The write queue state machine.
///
/// Generic over [`Environment`] so tests drive it with a manual clock.
/// Internally time is normalized to the duration since construction, which
/// keeps deadline arithmetic in one representation regardless of the
/// environment's instant type.
pub struct CommandQueue<E: Environment> {
    env: E,
    origin: E::Instant,
    queue: VecDeque<PendingWrite>,
    in_flight: Option<InFlight>,
    /// When the most recent confirmation arrived; gates the 50 ms spacing.
    last_complete_at: Option<TimePoint>,
}

impl<E: Environment> CommandQueue<E> {
    /// Create an idle queue.
    pub fn new(env: E) -> Self {
        let origin = env.now();
        Self { env, origin, queue: VecDeque::new(), in_flight: None, last_complete_at: None }
    }

    fn now(&self) -> TimePoint {
        self.env.now() - self.origin
    }

    /// Number of writes waiting behind the in-flight one.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.queue.len()
    }

    /// Whether a write is on the wire or waiting for retry.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// The next instant at which [`QueueEvent::Tick`] must be delivered,
    /// expressed as a duration since queue construction. `None` means the
    /// queue is quiescent until the next external event.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Duration> {
        if let Some(in_flight) = &self.in_flight {
            return in_flight.retry_at.or(in_flight.timeout_at);
        }
        if !self.queue.is_empty() {
            // Waiting out the pacing window
            if let Some(last) = self.last_complete_at {
                return Some(last + WRITE_SPACING);
            }
        }
        None
    }

    /// Process one event, returning actions for the backend to execute.
    pub fn process_event(&mut self, event: QueueEvent) -> Vec<QueueAction> {
        match event {
            QueueEvent::Submit(write) => {
                self.queue.push_back(write);
                self.pump()
            },
            QueueEvent::SubmitUrgent(write) => {
                self.queue.clear();
                // Abandon any in-flight confirmation tracking; the urgent
                // write takes over the wire.
                self.in_flight = Some(InFlight {
                    write: write.clone(),
                    retry_count: 0,
                    timeout_at: Some(self.now() + WRITE_TIMEOUT),
                    retry_at: None,
                });
                vec![QueueAction::SubmitWrite(write)]
            },
            QueueEvent::WriteConfirmed => {
                let mut actions = Vec::new();
                if let Some(in_flight) = self.in_flight.take() {
                    self.last_complete_at = Some(self.now());
                    actions.push(QueueAction::EmitWriteComplete(in_flight.write));
                }
                actions.extend(self.pump());
                actions
            },
            QueueEvent::WriteFailed => self.handle_failure(),
            QueueEvent::Tick => self.handle_tick(),
            QueueEvent::Clear => {
                self.queue.clear();
                self.in_flight = None;
                Vec::new()
            },
            QueueEvent::Disconnected => {
                self.queue.clear();
                self.in_flight = None;
                self.last_complete_at = None;
                Vec::new()
            },
        }
    }

    fn handle_tick(&mut self) -> Vec<QueueAction> {
        let now = self.now();

        if let Some(in_flight) = &mut self.in_flight {
            // A scheduled retry whose backoff elapsed goes back on the wire.
            if let Some(retry_at) = in_flight.retry_at {
                if now >= retry_at {
                    in_flight.retry_at = None;
                    in_flight.timeout_at = Some(now + WRITE_TIMEOUT);
                    return vec![QueueAction::SubmitWrite(in_flight.write.clone())];
                }
                return Vec::new();
            }
            // An unconfirmed write whose timeout elapsed is treated as failed.
            if let Some(timeout_at) = in_flight.timeout_at {
                if now >= timeout_at {
                    return self.handle_failure();
                }
            }
            return Vec::new();
        }

        self.pump()
    }

    fn handle_failure(&mut self) -> Vec<QueueAction> {
        let Some(mut in_flight) = self.in_flight.take() else {
            return Vec::new();
        };

        if in_flight.retry_count < MAX_WRITE_RETRIES {
            in_flight.retry_count += 1;
            in_flight.timeout_at = None;
            in_flight.retry_at = Some(self.now() + RETRY_BACKOFF);
            tracing::debug!(
                endpoint = %in_flight.write.endpoint,
                retry = in_flight.retry_count,
                "write unconfirmed, scheduling retry"
            );
            self.in_flight = Some(in_flight);
            return Vec::new();
        }

        tracing::warn!(endpoint = %in_flight.write.endpoint, "write dropped after retries");
        let mut actions = vec![QueueAction::DropWrite(in_flight.write)];
        actions.extend(self.pump());
        actions
    }

    /// Dequeue the next write if the wire is free and the pacing window has
    /// elapsed.
    fn pump(&mut self) -> Vec<QueueAction> {
        if self.in_flight.is_some() || self.queue.is_empty() {
            return Vec::new();
        }
        if let Some(last) = self.last_complete_at {
            if self.now() - last < WRITE_SPACING {
                // next_deadline covers the remainder of the window
                return Vec::new();
            }
        }
        let write = match self.queue.pop_front() {
            Some(write) => write,
            None => return Vec::new(),
        };
        self.in_flight = Some(InFlight {
            write: write.clone(),
            retry_count: 0,
            timeout_at: Some(self.now() + WRITE_TIMEOUT),
            retry_at: None,
        });
        vec![QueueAction::SubmitWrite(write)]
    }
}

#[cfg(test)]
mod tests {
    use decenza_core::env::ManualEnv;

    use super::*;
    use crate::endpoints;

    fn write(tag: u8) -> PendingWrite {
        PendingWrite { endpoint: endpoints::FRAME_WRITE, data: Bytes::from(vec![tag]) }
    }

    fn submit(queue: &mut CommandQueue<ManualEnv>, tag: u8) -> Vec<QueueAction> {
        queue.process_event(QueueEvent::Submit(write(tag)))
    }

    #[test]
    fn writes_are_serialized_with_spacing() {
        let env = ManualEnv::new();
        let mut queue = CommandQueue::new(env.clone());

        // First write goes straight to the wire
        let actions = submit(&mut queue, 1);
        assert!(matches!(actions.as_slice(), [QueueAction::SubmitWrite(w)] if w.data[0] == 1));

        // Second and third wait behind it
        assert!(submit(&mut queue, 2).is_empty());
        assert!(submit(&mut queue, 3).is_empty());
        assert_eq!(queue.depth(), 2);

        // Confirmation emits completion but respects the 50 ms window
        let actions = queue.process_event(QueueEvent::WriteConfirmed);
        assert!(
            matches!(actions.as_slice(), [QueueAction::EmitWriteComplete(w)] if w.data[0] == 1)
        );
        assert_eq!(queue.next_deadline(), Some(Duration::from_millis(50)));

        // Before the window: nothing
        env.advance(Duration::from_millis(20));
        assert!(queue.process_event(QueueEvent::Tick).is_empty());

        // After the window: next write submits
        env.advance(Duration::from_millis(30));
        let actions = queue.process_event(QueueEvent::Tick);
        assert!(matches!(actions.as_slice(), [QueueAction::SubmitWrite(w)] if w.data[0] == 2));
    }

    #[test]
    fn unconfirmed_write_retries_three_times_then_drops() {
        let env = ManualEnv::new();
        let mut queue = CommandQueue::new(env.clone());
        submit(&mut queue, 1);
        assert!(submit(&mut queue, 2).is_empty());

        for retry in 1..=MAX_WRITE_RETRIES {
            // 5 s timeout elapses: retry scheduled, nothing on the wire yet
            env.advance(WRITE_TIMEOUT);
            let actions = queue.process_event(QueueEvent::Tick);
            assert!(actions.is_empty(), "retry {retry} should be deferred by backoff");

            // 100 ms backoff elapses: resubmission
            env.advance(RETRY_BACKOFF);
            let actions = queue.process_event(QueueEvent::Tick);
            assert!(
                matches!(actions.as_slice(), [QueueAction::SubmitWrite(w)] if w.data[0] == 1),
                "retry {retry} should resubmit"
            );
        }

        // Final timeout: dropped, queue advances to the next write
        env.advance(WRITE_TIMEOUT);
        let actions = queue.process_event(QueueEvent::Tick);
        assert_eq!(actions.len(), 2);
        assert!(matches!(&actions[0], QueueAction::DropWrite(w) if w.data[0] == 1));
        assert!(matches!(&actions[1], QueueAction::SubmitWrite(w) if w.data[0] == 2));
    }

    #[test]
    fn host_stack_write_error_follows_retry_path() {
        let env = ManualEnv::new();
        let mut queue = CommandQueue::new(env.clone());
        submit(&mut queue, 1);

        let actions = queue.process_event(QueueEvent::WriteFailed);
        assert!(actions.is_empty());
        assert_eq!(queue.next_deadline(), Some(RETRY_BACKOFF));

        env.advance(RETRY_BACKOFF);
        let actions = queue.process_event(QueueEvent::Tick);
        assert!(matches!(actions.as_slice(), [QueueAction::SubmitWrite(w)] if w.data[0] == 1));
    }

    #[test]
    fn urgent_write_flushes_queue_and_submits_immediately() {
        let env = ManualEnv::new();
        let mut queue = CommandQueue::new(env);
        submit(&mut queue, 1);
        submit(&mut queue, 2);
        submit(&mut queue, 3);
        assert_eq!(queue.depth(), 2);

        let actions = queue.process_event(QueueEvent::SubmitUrgent(write(9)));
        assert!(matches!(actions.as_slice(), [QueueAction::SubmitWrite(w)] if w.data[0] == 9));
        assert_eq!(queue.depth(), 0);
    }

    #[test]
    fn disconnect_abandons_everything() {
        let env = ManualEnv::new();
        let mut queue = CommandQueue::new(env);
        submit(&mut queue, 1);
        submit(&mut queue, 2);

        assert!(queue.process_event(QueueEvent::Disconnected).is_empty());
        assert!(!queue.is_busy());
        assert_eq!(queue.depth(), 0);
        assert_eq!(queue.next_deadline(), None);
    }
}

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;

use super::AppCore;
use crate::bridge::{SendOutcome, TransportError};
use crate::error::SyncError;
use crate::state::{now_millis, DeliveryStatus};
use crate::updates::{CoreMsg, InternalEvent};

/// Exponential backoff for automatic resends.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_auto_retries: u32,
    /// Spread each delay by up to ±20%, still bounded by `cap`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_auto_retries: 5,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before automatic retry number `n` (1-based).
    pub fn backoff(&self, n: u32) -> Duration {
        let exp = n.saturating_sub(1).min(20);
        let raw = self.base.saturating_mul(1u32 << exp).min(self.cap);
        if !self.jitter {
            return raw;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-0.2..0.2);
        Duration::from_millis((raw.as_millis() as f64 * factor) as u64).min(self.cap)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    pub conversation_id: String,
    /// Sends dispatched so far; identifies which async result is current.
    pub attempt: u32,
    pub auto_retries: u32,
    pub in_flight: bool,
    /// Accepted by the transport; `attempt` now names the ack deadline.
    pub awaiting_ack: bool,
    /// Permanent failure or retry budget spent; only a manual retry revives it.
    pub parked: bool,
    /// Restored from the cache as a transient failure; resent on the next connect.
    pub resume: bool,
}

/// Bookkeeping for unconfirmed sends, keyed by client temp id.
#[derive(Debug)]
pub struct Outbox {
    policy: RetryPolicy,
    entries: HashMap<String, OutboxEntry>,
}

impl Outbox {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn get(&self, client_temp_id: &str) -> Option<&OutboxEntry> {
        self.entries.get(client_temp_id)
    }

    pub fn track(&mut self, conversation_id: &str, client_temp_id: &str) {
        self.entries
            .entry(client_temp_id.to_string())
            .or_insert_with(|| OutboxEntry {
                conversation_id: conversation_id.to_string(),
                attempt: 0,
                auto_retries: 0,
                in_flight: false,
                awaiting_ack: false,
                parked: false,
                resume: false,
            });
    }

    pub fn remove(&mut self, client_temp_id: &str) -> Option<OutboxEntry> {
        self.entries.remove(client_temp_id)
    }

    /// Starts a new send attempt; returns its number, or `None` if one is already in flight.
    pub fn begin_attempt(&mut self, client_temp_id: &str) -> Option<u32> {
        let entry = self.entries.get_mut(client_temp_id)?;
        if entry.in_flight {
            return None;
        }
        entry.attempt += 1;
        entry.in_flight = true;
        entry.awaiting_ack = false;
        entry.resume = false;
        Some(entry.attempt)
    }

    /// The in-flight send was accepted. Starts a new deadline for the ack; the send's own
    /// timer goes stale.
    pub fn await_ack(&mut self, client_temp_id: &str) -> Option<u32> {
        let entry = self.entries.get_mut(client_temp_id)?;
        if !entry.in_flight {
            return None;
        }
        entry.in_flight = false;
        entry.awaiting_ack = true;
        entry.attempt += 1;
        Some(entry.attempt)
    }

    pub fn is_current(&self, client_temp_id: &str, attempt: u32) -> bool {
        self.entries
            .get(client_temp_id)
            .is_some_and(|e| e.attempt == attempt)
    }

    pub fn is_in_flight(&self, client_temp_id: &str, attempt: u32) -> bool {
        self.entries
            .get(client_temp_id)
            .is_some_and(|e| e.attempt == attempt && e.in_flight)
    }

    pub fn is_awaiting_ack(&self, client_temp_id: &str, attempt: u32) -> bool {
        self.entries
            .get(client_temp_id)
            .is_some_and(|e| e.attempt == attempt && e.awaiting_ack)
    }

    pub fn finish_attempt(&mut self, client_temp_id: &str) {
        if let Some(entry) = self.entries.get_mut(client_temp_id) {
            entry.in_flight = false;
            entry.awaiting_ack = false;
        }
    }

    /// Consumes one automatic retry. Returns the attempt the timer belongs to and its delay,
    /// or `None` once the budget is spent (the entry is parked).
    pub fn schedule_auto_retry(&mut self, client_temp_id: &str) -> Option<(u32, Duration)> {
        let entry = self.entries.get_mut(client_temp_id)?;
        if entry.parked || entry.auto_retries >= self.policy.max_auto_retries {
            entry.parked = true;
            return None;
        }
        entry.auto_retries += 1;
        Some((entry.attempt, self.policy.backoff(entry.auto_retries)))
    }

    pub fn park(&mut self, client_temp_id: &str) {
        if let Some(entry) = self.entries.get_mut(client_temp_id) {
            entry.parked = true;
        }
    }

    pub fn mark_resume(&mut self, client_temp_id: &str) {
        if let Some(entry) = self.entries.get_mut(client_temp_id) {
            entry.resume = true;
        }
    }

    /// A user-initiated retry gets a fresh automatic budget.
    pub fn reset_budget(&mut self, client_temp_id: &str) {
        if let Some(entry) = self.entries.get_mut(client_temp_id) {
            entry.auto_retries = 0;
            entry.parked = false;
        }
    }

    /// Entries that should go out once connectivity returns: (conversation, temp id, resume).
    pub fn idle(&self) -> Vec<(String, String, bool)> {
        let mut out: Vec<(String, String, bool)> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.in_flight && !e.awaiting_ack && !e.parked)
            .map(|(temp, e)| (e.conversation_id.clone(), temp.clone(), e.resume))
            .collect();
        out.sort();
        out
    }
}

fn failure_reason(err: &SyncError) -> String {
    match err {
        SyncError::TransientTransportFailure(reason)
        | SyncError::PermanentTransportFailure(reason) => reason.clone(),
        other => other.to_string(),
    }
}

impl AppCore {
    pub(super) fn compose(&mut self, conversation_id: &str, body: &str) {
        let body = body.trim();
        if conversation_id.is_empty() || body.is_empty() {
            return;
        }
        let outgoing = crate::bridge::OutgoingMessage {
            conversation_id: conversation_id.to_string(),
            client_temp_id: uuid::Uuid::new_v4().to_string(),
            sender_id: self.local_user_id.clone(),
            body: body.to_string(),
            created_at_ms: self.next_outgoing_ts(),
        };

        if let Err(e) = self.store_mut(conversation_id).insert_pending(&outgoing) {
            tracing::error!(%e, conversation_id, "insert_pending failed");
            self.toast(format!("Couldn't queue message: {e}"));
            return;
        }
        tracing::debug!(
            conversation_id,
            client_temp_id = %outgoing.client_temp_id,
            "message queued"
        );
        self.outbox.track(conversation_id, &outgoing.client_temp_id);
        self.touch(conversation_id);
        self.dispatch_send(conversation_id, &outgoing.client_temp_id);
    }

    /// Hands a pending entry to the transport. Offline or bridge-less, it simply stays queued.
    pub(super) fn dispatch_send(&mut self, conversation_id: &str, client_temp_id: &str) {
        if !self.state.connectivity.is_connected() {
            tracing::debug!(client_temp_id, "offline; send stays queued");
            return;
        }
        let Some(transport) = self.transport() else {
            tracing::debug!(client_temp_id, "no transport bridge; send stays queued");
            return;
        };
        let Some(outgoing) = self
            .stores
            .get(conversation_id)
            .and_then(|s| s.local_entry(client_temp_id))
            .filter(|m| m.status() == DeliveryStatus::Pending)
            .and_then(|m| m.to_outgoing())
        else {
            return;
        };
        let Some(attempt) = self.outbox.begin_attempt(client_temp_id) else {
            return;
        };
        tracing::info!(conversation_id, client_temp_id, attempt, "send");

        let credentials = self.credential_provider();
        let tx = self.core_sender.clone();
        let conversation_id = conversation_id.to_string();
        let client_temp_id = client_temp_id.to_string();
        {
            let conversation_id = conversation_id.clone();
            let client_temp_id = client_temp_id.clone();
            self.runtime.spawn_blocking(move || {
                let outcome = match super::sync::bearer(credentials.as_deref()) {
                    Ok(credential) => transport.send(outgoing, credential),
                    Err(error) => SendOutcome::Failed { error },
                };
                let _ = tx.send(CoreMsg::Internal(Box::new(
                    InternalEvent::SendCompleted {
                        conversation_id,
                        client_temp_id,
                        attempt,
                        outcome,
                    },
                )));
            });
        }

        self.arm_send_timeout(conversation_id, client_temp_id, attempt);
    }

    fn arm_send_timeout(&self, conversation_id: String, client_temp_id: String, attempt: u32) {
        let tx = self.core_sender.clone();
        let timeout = self.config.send_timeout();
        self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(CoreMsg::Internal(Box::new(
                InternalEvent::SendTimedOut {
                    conversation_id,
                    client_temp_id,
                    attempt,
                },
            )));
        });
    }

    pub(super) fn handle_send_completed(
        &mut self,
        conversation_id: &str,
        client_temp_id: &str,
        attempt: u32,
        outcome: SendOutcome,
    ) {
        match outcome {
            SendOutcome::Confirmed { message } => {
                // A confirmation is honored even if it belongs to a superseded attempt.
                self.outbox.remove(client_temp_id);
                self.apply_confirmation(conversation_id, client_temp_id, message);
            }
            SendOutcome::Accepted => {
                if !self.outbox.is_in_flight(client_temp_id, attempt) {
                    tracing::debug!(client_temp_id, attempt, "stale send acceptance ignored");
                    return;
                }
                let marked = match self.stores.get_mut(conversation_id) {
                    Some(store) => store.mark_sent(client_temp_id),
                    None => Err(SyncError::UnknownMessage(client_temp_id.to_string())),
                };
                if let Err(e) = marked {
                    tracing::debug!(%e, client_temp_id, "mark_sent skipped");
                    self.outbox.finish_attempt(client_temp_id);
                    return;
                }
                self.touch(conversation_id);
                if let Some(deadline) = self.outbox.await_ack(client_temp_id) {
                    self.arm_send_timeout(
                        conversation_id.to_string(),
                        client_temp_id.to_string(),
                        deadline,
                    );
                }
            }
            SendOutcome::Failed { error } => {
                if !self.outbox.is_in_flight(client_temp_id, attempt) {
                    tracing::debug!(client_temp_id, attempt, "stale send failure ignored");
                    return;
                }
                self.outbox.finish_attempt(client_temp_id);
                self.apply_send_failure(conversation_id, client_temp_id, error.into());
            }
        }
    }

    pub(super) fn handle_send_timed_out(
        &mut self,
        conversation_id: &str,
        client_temp_id: &str,
        attempt: u32,
    ) {
        let secs = self.config.send_timeout().as_secs();
        if self.outbox.is_awaiting_ack(client_temp_id, attempt) {
            self.outbox.finish_attempt(client_temp_id);
            let reason = format!("no acknowledgement within {secs}s");
            let expired = match self.stores.get_mut(conversation_id) {
                Some(store) => store.expire_sent(client_temp_id, reason.clone()),
                None => Err(SyncError::UnknownMessage(client_temp_id.to_string())),
            };
            match expired {
                Ok(()) => {
                    tracing::warn!(client_temp_id, attempt, "ack timed out");
                    self.settle_failure(conversation_id, client_temp_id, reason, false);
                }
                Err(e) => tracing::debug!(%e, client_temp_id, "ack timeout skipped"),
            }
            return;
        }
        if !self.outbox.is_in_flight(client_temp_id, attempt) {
            return;
        }
        tracing::warn!(client_temp_id, attempt, "send timed out");
        self.outbox.finish_attempt(client_temp_id);
        self.apply_send_failure(
            conversation_id,
            client_temp_id,
            TransportError::Transient {
                reason: format!("no confirmation within {secs}s"),
            }
            .into(),
        );
    }

    fn apply_send_failure(&mut self, conversation_id: &str, client_temp_id: &str, err: SyncError) {
        let permanent = !err.is_transient();
        let reason = failure_reason(&err);
        let Some(store) = self.stores.get_mut(conversation_id) else {
            return;
        };
        if let Err(e) = store.mark_failed(client_temp_id, reason.clone(), permanent) {
            tracing::debug!(%e, client_temp_id, "mark_failed skipped");
            return;
        }
        tracing::warn!(%err, conversation_id, client_temp_id, "send failed");
        self.settle_failure(conversation_id, client_temp_id, reason, permanent);
    }

    // The entry is already `Failed`; report it and schedule what comes next.
    fn settle_failure(
        &mut self,
        conversation_id: &str,
        client_temp_id: &str,
        reason: String,
        permanent: bool,
    ) {
        self.touch(conversation_id);

        if permanent {
            self.outbox.park(client_temp_id);
            self.emit_delivery_failed(conversation_id, client_temp_id, reason, true);
            return;
        }
        match self.outbox.schedule_auto_retry(client_temp_id) {
            Some((attempt, delay)) => {
                tracing::debug!(client_temp_id, attempt, ?delay, "auto retry scheduled");
                let tx = self.core_sender.clone();
                let conversation_id = conversation_id.to_string();
                let client_temp_id = client_temp_id.to_string();
                self.runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(CoreMsg::Internal(Box::new(
                        InternalEvent::RetryDue {
                            conversation_id,
                            client_temp_id,
                            attempt,
                        },
                    )));
                });
            }
            None => {
                tracing::warn!(client_temp_id, "automatic retries exhausted");
                self.emit_delivery_failed(conversation_id, client_temp_id, reason, false);
            }
        }
    }

    /// Failed -> pending and resend. Manual retries reset the automatic budget.
    pub(super) fn retry_message(
        &mut self,
        conversation_id: &str,
        client_temp_id: &str,
        manual: bool,
    ) {
        let now = now_millis();
        let result = match self.stores.get_mut(conversation_id) {
            Some(store) => store.retry(client_temp_id, now),
            None => Err(SyncError::UnknownMessage(client_temp_id.to_string())),
        };
        if let Err(e) = result {
            tracing::debug!(%e, client_temp_id, manual, "retry rejected");
            if manual {
                self.toast(format!("Can't retry: {e}"));
            }
            return;
        }
        self.outbox.track(conversation_id, client_temp_id);
        if manual {
            self.outbox.reset_budget(client_temp_id);
        }
        self.touch(conversation_id);
        self.dispatch_send(conversation_id, client_temp_id);
    }

    /// Sends everything queued while offline, oldest conversation-local order first.
    pub(super) fn flush_outbox(&mut self) {
        for (conversation_id, client_temp_id, resume) in self.outbox.idle() {
            let status = self
                .stores
                .get(&conversation_id)
                .and_then(|s| s.local_entry(&client_temp_id))
                .map(|m| m.status());
            match status {
                Some(DeliveryStatus::Pending) => self.dispatch_send(&conversation_id, &client_temp_id),
                Some(DeliveryStatus::Failed) if resume => {
                    self.retry_message(&conversation_id, &client_temp_id, false)
                }
                Some(_) => {}
                None => {
                    self.outbox.remove(&client_temp_id);
                }
            }
        }
    }
}

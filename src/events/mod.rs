use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Handle for publishing checkout events into the in-process channel
#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Queues an event without waiting; a full or closed channel drops it with a warning
    pub fn send_or_log(&self, event: Event) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(?event, "event channel full, event dropped");
            }
            Err(TrySendError::Closed(event)) => {
                warn!(?event, "event channel closed, event dropped");
            }
        }
    }
}

/// Post-payment side effect that can fail after the payment itself succeeded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStep {
    Roster,
    Enrollment,
    Wallet,
    Coupon,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    CheckoutStarted {
        order_id: Uuid,
        user_id: Uuid,
        payable_amount: i64,
    },
    PaymentRequested {
        order_id: Uuid,
        transaction_id: Uuid,
        authority: String,
    },
    PaymentVerified {
        order_id: Uuid,
        transaction_id: Uuid,
        reference_id: String,
    },
    PaymentRejected {
        order_id: Uuid,
        code: i32,
    },
    MemberEnrolled {
        program_id: Uuid,
        user_id: Uuid,
    },
    CouponConsumed {
        coupon_id: Uuid,
        order_id: Uuid,
    },
    CommitStepFailed {
        order_id: Uuid,
        step: CommitStep,
        reason: String,
    },
    OrderCancelled(Uuid),
    OrderDeleted(Uuid),
    SessionScheduled {
        session_id: Uuid,
        program_id: Uuid,
        coach_id: Uuid,
    },
}

/// Drains the event channel until every sender is dropped
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::CommitStepFailed {
                order_id,
                step,
                reason,
            } => {
                error!(
                    %order_id,
                    ?step,
                    reason = %reason,
                    "post-payment step needs manual reconciliation"
                );
            }
            Event::PaymentRejected { order_id, code } => {
                warn!(%order_id, code, "payment rejected by gateway");
            }
            other => {
                info!(event = ?other, "event processed");
            }
        }
    }

    info!("Event channel closed, stopping event processing");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_fails_once_receiver_is_gone() {
        let (tx, rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);
        drop(rx);
        assert!(sender.send(Event::OrderCancelled(Uuid::new_v4())).await.is_err());
        sender.send_or_log(Event::OrderDeleted(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn send_or_log_does_not_wait_on_a_full_channel() {
        let (tx, mut rx) = mpsc::channel(1);
        let sender = EventSender::new(tx);
        let first = Uuid::new_v4();
        sender.send_or_log(Event::OrderCancelled(first));
        sender.send_or_log(Event::OrderCancelled(Uuid::new_v4()));

        assert!(matches!(rx.recv().await, Some(Event::OrderCancelled(id)) if id == first));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn process_events_returns_when_senders_drop() {
        let (tx, rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);
        sender
            .send(Event::MemberEnrolled {
                program_id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
            })
            .await
            .unwrap();
        drop(sender);
        process_events(rx).await;
    }
}

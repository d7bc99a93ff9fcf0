use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::payment::PaymentStatus;
use crate::entities::quote::QuoteStatus;

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

    /// Fire-and-forget publish; a closed or full channel only logs.
    pub fn publish(&self, event: Event) {
        if let Err(e) = self.sender.try_send(event) {
            warn!("Dropping domain event: {}", e);
            counter!("events.dropped", 1);
        }
    }
}

/// Creates a bounded event channel
pub fn channel(capacity: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender::new(tx), rx)
}

/// Things that happened to quotes and payments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    QuoteCreated {
        quote_id: Uuid,
        quote_number: String,
    },
    QuoteUpdated(Uuid),
    QuoteStatusChanged {
        quote_id: Uuid,
        from: QuoteStatus,
        to: QuoteStatus,
    },
    QuotesExpired {
        count: u64,
    },
    MeetingScheduled {
        quote_id: Uuid,
        meeting_id: Uuid,
    },
    PaymentCreated {
        payment_id: Uuid,
        status: PaymentStatus,
    },
    PaymentStatusChanged {
        payment_id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
    },
    WebhookHandled {
        provider: String,
        event_type: String,
        outcome: String,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::QuoteCreated { .. } => "quote_created",
            Event::QuoteUpdated(_) => "quote_updated",
            Event::QuoteStatusChanged { .. } => "quote_status_changed",
            Event::QuotesExpired { .. } => "quotes_expired",
            Event::MeetingScheduled { .. } => "meeting_scheduled",
            Event::PaymentCreated { .. } => "payment_created",
            Event::PaymentStatusChanged { .. } => "payment_status_changed",
            Event::WebhookHandled { .. } => "webhook_handled",
        }
    }
}

/// Drains the channel, logging and counting each event. Returns how many
/// events were seen once every sender is gone.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) -> u64 {
    info!("Starting event processing loop");
    let mut processed = 0;

    while let Some(event) = rx.recv().await {
        processed += 1;
        counter!("events.processed", 1, "event" => event.name());

        match &event {
            Event::QuoteStatusChanged { quote_id, from, to } => {
                info!(%quote_id, %from, %to, "quote status changed");
                counter!("quotes.transitions", 1, "to" => to.to_string());
            }
            Event::QuotesExpired { count } => {
                info!(count, "expiry sweep closed overdue quotes");
                counter!("quotes.expired", *count);
            }
            Event::PaymentStatusChanged {
                payment_id,
                from,
                to,
            } => {
                info!(%payment_id, %from, %to, "payment status changed");
                counter!("payments.transitions", 1, "to" => to.to_string());
            }
            Event::WebhookHandled {
                provider,
                event_type,
                outcome,
            } => {
                info!(%provider, %event_type, %outcome, "webhook handled");
                counter!(
                    "webhooks.handled",
                    1,
                    "provider" => provider.clone(),
                    "outcome" => outcome.clone()
                );
            }
            other => info!(event = ?other, "domain event"),
        }
    }

    info!(processed, "Event processing loop stopped");
    processed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn process_events_drains_until_senders_drop() {
        let (sender, rx) = channel(8);
        let worker = tokio::spawn(process_events(rx));

        sender.publish(Event::QuoteUpdated(Uuid::new_v4()));
        sender
            .send(Event::QuoteStatusChanged {
                quote_id: Uuid::new_v4(),
                from: QuoteStatus::Draft,
                to: QuoteStatus::Sent,
            })
            .await
            .unwrap();
        drop(sender);

        assert_eq!(worker.await.unwrap(), 2);
    }

    #[test]
    fn publish_on_full_channel_does_not_panic() {
        let (sender, _rx) = channel(1);
        sender.publish(Event::QuotesExpired { count: 1 });
        sender.publish(Event::QuotesExpired { count: 2 });
    }
}

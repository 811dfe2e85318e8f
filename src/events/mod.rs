use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Domain events emitted after a cart or order transaction commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    // Cart events
    CartCreated(Uuid),
    CartItemAdded { cart_id: Uuid, product_id: Uuid },
    CartItemUpdated { cart_id: Uuid, item_id: Uuid },
    CartItemRemoved { cart_id: Uuid, item_id: Uuid },
    CartCleared(Uuid),
    CartMerged {
        guest_cart_id: Uuid,
        user_cart_id: Uuid,
        clamped_lines: usize,
    },

    // Order events
    OrderCreated(Uuid),
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },

    // Catalog events
    ProductCreated(Uuid),

    // Auth events
    UserRegistered(Uuid),
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
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

    /// Sends and logs instead of failing; the triggering transaction has
    /// already committed by the time events go out.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!("{}", e);
        }
    }
}

/// Creates a bounded channel and the sender wrapper for it.
pub fn channel(capacity: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender::new(tx), rx)
}

/// Drains the event channel, logging each event. Returns once every sender
/// has been dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::CartMerged {
                guest_cart_id,
                user_cart_id,
                clamped_lines,
            } if *clamped_lines > 0 => {
                warn!(
                    %guest_cart_id,
                    %user_cart_id,
                    clamped_lines,
                    "guest cart merged with quantities clamped to stock"
                );
            }
            Event::OrderCreated(order_id) => {
                info!(%order_id, "order created");
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => {
                info!(%order_id, %old_status, %new_status, "order status changed");
            }
            other => info!(event = ?other, "event"),
        }
    }

    info!("Event processing loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_delivers_to_receiver() {
        let (sender, mut rx) = channel(4);
        let cart_id = Uuid::new_v4();
        sender.send(Event::CartCleared(cart_id)).await.unwrap();
        assert_eq!(rx.recv().await, Some(Event::CartCleared(cart_id)));
    }

    #[tokio::test]
    async fn send_or_log_swallows_closed_channel() {
        let (sender, rx) = channel(1);
        drop(rx);
        assert!(sender.send(Event::CartCreated(Uuid::new_v4())).await.is_err());
        sender.send_or_log(Event::CartCreated(Uuid::new_v4())).await;
    }

    #[tokio::test]
    async fn process_events_exits_when_senders_drop() {
        let (sender, rx) = channel(4);
        let handle = tokio::spawn(process_events(rx));
        sender.send(Event::OrderCreated(Uuid::new_v4())).await.unwrap();
        drop(sender);
        handle.await.unwrap();
    }
}

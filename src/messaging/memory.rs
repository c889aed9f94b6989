//! # In-Memory Queue
//!
//! Bounded tokio channel behind the [`MessageQueue`] trait. Single logical
//! consumer: concurrent `receive` calls share one receiver, so each message
//! is delivered to exactly one caller (duplicates only come from producers
//! re-emitting, which is the at-least-once behavior the dedup layer guards).

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::QueueError;
use crate::messaging::MessageQueue;

pub struct InMemoryQueue<M> {
    name: String,
    sender: mpsc::Sender<M>,
    receiver: Mutex<mpsc::Receiver<M>>,
}

impl<M> InMemoryQueue<M> {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        InMemoryQueue {
            name: name.into(),
            sender,
            receiver: Mutex::new(receiver),
        }
    }
}

#[async_trait]
impl<M> MessageQueue<M> for InMemoryQueue<M>
where
    M: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn emit(&self, message: M) -> Result<(), QueueError> {
        self.sender
            .send(message)
            .await
            .map_err(|_| QueueError::Closed {
                queue: self.name.clone(),
            })
    }

    async fn receive(&self) -> Option<M> {
        self.receiver.lock().await.recv().await
    }
}

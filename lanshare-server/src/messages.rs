use std::collections::VecDeque;

use chrono::Utc;
use lanshare_core::Message;
use tokio::sync::RwLock;

/// Chat history in arrival order, bounded to the most recent `capacity` entries.
#[derive(Debug)]
pub struct MessageLog {
    capacity: usize,
    entries: RwLock<VecDeque<Message>>,
}

impl MessageLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: RwLock::new(VecDeque::new()),
        }
    }

    pub async fn append(&self, text: String, sender: Option<String>) -> Message {
        let id: [u8; 8] = rand::random();
        let message = Message {
            id: Some(hex::encode(id)),
            text,
            timestamp: Utc::now(),
            sender,
        };

        let mut entries = self.entries.write().await;
        entries.push_back(message.clone());
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        message
    }

    pub async fn list(&self) -> Vec<Message> {
        self.entries.read().await.iter().cloned().collect()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

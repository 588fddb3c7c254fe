use std::collections::VecDeque;

use crate::core::message::{Message, MessageMeta};

/// FIFO of assistant messages waiting to reach the transcript. A single
/// consumer drains it to completion, so parts of one reply never interleave
/// with parts of another.
#[derive(Debug, Default)]
pub struct MessageQueue {
    queue: VecDeque<Message>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue each non-empty part as its own message, in order. `final_meta`
    /// goes on the last emitted part only. Returns the number queued.
    pub fn enqueue(&mut self, parts: &[String], final_meta: MessageMeta) -> usize {
        let parts: Vec<&str> = parts
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .collect();

        let last = parts.len().saturating_sub(1);
        for (i, part) in parts.iter().enumerate() {
            let meta = if i == last {
                final_meta.clone()
            } else {
                MessageMeta::default()
            };
            self.queue.push_back(Message::new_assistant(part.to_string(), meta));
        }
        parts.len()
    }

    pub fn enqueue_message(&mut self, message: Message) {
        self.queue.push_back(message);
    }

    /// Drain every queued message into `transcript`, returning what was added.
    pub fn flush(&mut self, transcript: &mut Vec<Message>) -> Vec<Message> {
        let flushed: Vec<Message> = self.queue.drain(..).collect();
        transcript.extend(flushed.iter().cloned());
        flushed
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::MessageRole;

    #[test]
    fn test_parts_become_ordered_messages() {
        let mut queue = MessageQueue::new();
        let parts = vec!["First.".to_string(), "  ".into(), "Second.".into(), "Third.".into()];
        assert_eq!(queue.enqueue(&parts, MessageMeta::price(5_000)), 3);

        let mut transcript = Vec::new();
        let flushed = queue.flush(&mut transcript);
        let texts: Vec<&str> = transcript.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["First.", "Second.", "Third."]);
        assert_eq!(flushed.len(), 3);
        assert!(transcript.iter().all(|m| m.role == MessageRole::Assistant));

        assert!(transcript[0].meta.is_empty());
        assert!(transcript[1].meta.is_empty());
        assert_eq!(transcript[2].meta.offer_cents, Some(5_000));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_back_to_back_replies_do_not_interleave() {
        let mut queue = MessageQueue::new();
        queue.enqueue(&["a1".into(), "a2".into()], MessageMeta::default());
        queue.enqueue(&["b1".into(), "b2".into()], MessageMeta::default());

        let mut transcript = Vec::new();
        queue.flush(&mut transcript);
        let texts: Vec<&str> = transcript.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["a1", "a2", "b1", "b2"]);
    }

    #[test]
    fn test_empty_reply_emits_nothing() {
        let mut queue = MessageQueue::new();
        assert_eq!(queue.enqueue(&["".into(), " ".into()], MessageMeta::price(1)), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_clear_discards_queued() {
        let mut queue = MessageQueue::new();
        queue.enqueue(&["x".into()], MessageMeta::default());
        queue.clear();
        let mut transcript = Vec::new();
        assert!(queue.flush(&mut transcript).is_empty());
    }
}

use tokio::sync::watch;

use crate::message::Message;

/// Ordered message list shared with presentation layers.
///
/// Every mutation publishes the full list to subscribers through a `watch`
/// channel, so observers always see a consistent snapshot.
pub struct MessageAccumulator {
    messages: watch::Sender<Vec<Message>>,
}

impl MessageAccumulator {
    pub fn new() -> Self {
        let (messages, _) = watch::channel(Vec::new());
        Self { messages }
    }

    /// Observe the message list. The receiver starts at the current snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Vec<Message>> {
        self.messages.subscribe()
    }

    /// Add to the end; ids are never re-sorted.
    pub fn append(&self, message: Message) {
        self.messages.send_modify(|list| list.push(message));
    }

    /// Apply `updater` to the message with `id`. Returns false when absent.
    pub fn mutate<F>(&self, id: u64, updater: F) -> bool
    where
        F: FnOnce(&mut Message),
    {
        self.messages.send_if_modified(|list| match list.iter_mut().find(|m| m.id == id) {
            Some(message) => {
                updater(message);
                true
            }
            None => false,
        })
    }

    /// Replace everything with a single welcome message.
    pub fn reset(&self, welcome_id: u64, welcome_text: &str) {
        let welcome = Message::assistant(welcome_id, welcome_text);
        self.messages.send_replace(vec![welcome]);
    }

    pub fn contains(&self, id: u64) -> bool {
        self.messages.borrow().iter().any(|m| m.id == id)
    }

    pub fn get(&self, id: u64) -> Option<Message> {
        self.messages.borrow().iter().find(|m| m.id == id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.borrow().is_empty()
    }
}

impl Default for MessageAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_keeps_arrival_order() {
        let acc = MessageAccumulator::new();
        acc.append(Message::user(5, "later id first"));
        acc.append(Message::assistant(2, "earlier id second"));
        let ids: Vec<_> = acc.snapshot().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![5, 2]);
    }

    #[test]
    fn mutate_touches_only_the_matching_message() {
        let acc = MessageAccumulator::new();
        acc.append(Message::assistant(1, "a"));
        acc.append(Message::assistant(2, "b"));

        assert!(acc.mutate(2, |m| m.push_text("c")));
        assert_eq!(acc.get(1).unwrap().text, "a");
        assert_eq!(acc.get(2).unwrap().text, "bc");
    }

    #[test]
    fn mutate_missing_id_is_a_noop() {
        let acc = MessageAccumulator::new();
        acc.append(Message::assistant(1, "a"));
        let rx = acc.subscribe();

        assert!(!acc.mutate(9, |m| m.push_text("x")));
        assert!(!rx.has_changed().unwrap());
        assert_eq!(acc.snapshot().len(), 1);
    }

    #[test]
    fn reset_leaves_exactly_one_welcome() {
        let acc = MessageAccumulator::new();
        for id in 1..=6 {
            acc.append(Message::user(id, "x"));
        }
        acc.reset(7, "Welcome");
        let list = acc.snapshot();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, 7);
        assert_eq!(list[0].text, "Welcome");
    }

    #[test]
    fn subscribers_see_each_mutation() {
        let acc = MessageAccumulator::new();
        let mut rx = acc.subscribe();
        acc.append(Message::user(1, "hi"));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().len(), 1);
    }
}

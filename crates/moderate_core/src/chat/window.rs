use std::collections::VecDeque;

use moderate_domain::ChatMessage;

pub const DEFAULT_WINDOW_CAPACITY: usize = 200;

/// Insertion-ordered, bounded message buffer. Once full, every push drops
/// the oldest entry.
#[derive(Debug, Clone)]
pub struct MessageWindow {
	capacity: usize,
	messages: VecDeque<ChatMessage>,
}

impl Default for MessageWindow {
	fn default() -> Self {
		Self::new(DEFAULT_WINDOW_CAPACITY)
	}
}

impl MessageWindow {
	pub fn new(capacity: usize) -> Self {
		let capacity = capacity.max(1);
		Self {
			capacity,
			messages: VecDeque::with_capacity(capacity),
		}
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}

	pub fn len(&self) -> usize {
		self.messages.len()
	}

	pub fn is_empty(&self) -> bool {
		self.messages.is_empty()
	}

	/// Append a message, returning the evicted one if the window was full.
	pub fn push(&mut self, message: ChatMessage) -> Option<ChatMessage> {
		let evicted = if self.messages.len() >= self.capacity {
			self.messages.pop_front()
		} else {
			None
		};
		self.messages.push_back(message);
		evicted
	}

	pub fn clear(&mut self) {
		self.messages.clear();
	}

	pub fn snapshot(&self) -> Vec<ChatMessage> {
		self.messages.iter().cloned().collect()
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use moderate_domain::{ChatroomId, MessageIdentity, MessageSender};
	use proptest::prelude::*;

	use super::*;

	pub(crate) fn message(id: usize) -> ChatMessage {
		ChatMessage {
			id: format!("m{id}"),
			chatroom_id: ChatroomId(1),
			content: format!("hello {id}"),
			kind: "message".to_string(),
			created_at: "2024-05-01T12:00:00Z".to_string(),
			sender: MessageSender {
				id: 7,
				username: "viewer".to_string(),
				slug: "viewer".to_string(),
				identity: MessageIdentity::default(),
			},
			metadata: None,
		}
	}

	#[test]
	fn evicts_oldest_first() {
		let mut window = MessageWindow::new(2);
		assert!(window.push(message(1)).is_none());
		assert!(window.push(message(2)).is_none());
		let evicted = window.push(message(3)).unwrap();
		assert_eq!(evicted.id, "m1");
		let ids: Vec<_> = window.snapshot().into_iter().map(|m| m.id).collect();
		assert_eq!(ids, ["m2", "m3"]);
	}

	#[test]
	fn clear_keeps_capacity() {
		let mut window = MessageWindow::default();
		window.push(message(1));
		window.clear();
		assert!(window.is_empty());
		assert_eq!(window.capacity(), DEFAULT_WINDOW_CAPACITY);
	}

	#[test]
	fn zero_capacity_is_raised_to_one() {
		let mut window = MessageWindow::new(0);
		window.push(message(1));
		window.push(message(2));
		assert_eq!(window.len(), 1);
		assert_eq!(window.snapshot()[0].id, "m2");
	}

	proptest! {
		#[test]
		fn window_holds_the_last_n_in_order(n in 0usize..600) {
			let mut window = MessageWindow::default();
			for i in 0..n {
				window.push(message(i));
				prop_assert!(window.len() <= DEFAULT_WINDOW_CAPACITY);
			}
			let expected: Vec<String> = (n.saturating_sub(DEFAULT_WINDOW_CAPACITY)..n).map(|i| format!("m{i}")).collect();
			let actual: Vec<String> = window.snapshot().into_iter().map(|m| m.id).collect();
			prop_assert_eq!(actual, expected);
		}
	}
}

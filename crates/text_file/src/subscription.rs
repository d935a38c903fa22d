use crate::TextFileEvent;
use parking_lot::Mutex;
use std::{
    mem,
    sync::{Arc, Weak},
};

/// Fan-out point for model notifications. Each subscriber accumulates
/// events until it drains them with [`Subscription::consume`]; dropping the
/// subscription unsubscribes.
#[derive(Default)]
pub struct Topic(Mutex<Vec<Weak<Mutex<Vec<TextFileEvent>>>>>);

pub struct Subscription(Arc<Mutex<Vec<TextFileEvent>>>);

impl Topic {
    pub fn subscribe(&self) -> Subscription {
        let subscription = Subscription(Default::default());
        self.0.lock().push(Arc::downgrade(&subscription.0));
        subscription
    }

    pub fn publish(&self, events: impl IntoIterator<Item = TextFileEvent> + Clone) {
        self.0.lock().retain(|subscription| {
            if let Some(subscription) = subscription.upgrade() {
                subscription.lock().extend(events.clone());
                true
            } else {
                false
            }
        });
    }
}

impl Subscription {
    pub fn consume(&self) -> Vec<TextFileEvent> {
        mem::take(&mut *self.0.lock())
    }
}

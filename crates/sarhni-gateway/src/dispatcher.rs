use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;
use uuid::Uuid;

use sarhni_types::models::Confession;

/// Process-local publish/subscribe keyed by recipient user ID.
///
/// Delivery only reaches listeners subscribed at publish time; nothing is
/// buffered for late subscribers. Listeners of other processes are never
/// reached, so a multi-instance deployment needs a shared pub/sub backend
/// behind this same interface.
#[derive(Clone, Default)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

#[derive(Default)]
struct DispatcherInner {
    next_id: AtomicU64,
    /// recipient -> (listener id -> sender)
    listeners: RwLock<HashMap<Uuid, HashMap<u64, mpsc::UnboundedSender<Confession>>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start listening for confessions addressed to `recipient`.
    /// Dropping the returned subscription unsubscribes it.
    pub fn subscribe(&self, recipient: Uuid) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(recipient)
            .or_default()
            .insert(id, tx);

        Subscription {
            dispatcher: self.clone(),
            recipient,
            id,
            rx,
            active: true,
        }
    }

    /// Deliver to every current listener of `recipient`. Returns how many
    /// listeners received it. Listeners whose receiver is gone are pruned.
    pub fn publish(&self, recipient: Uuid, confession: &Confession) -> usize {
        let mut listeners = self
            .inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(by_id) = listeners.get_mut(&recipient) else {
            return 0;
        };

        let mut delivered = 0;
        by_id.retain(|_, tx| match tx.send(confession.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(_) => false,
        });
        if by_id.is_empty() {
            listeners.remove(&recipient);
        }
        delivered
    }

    pub fn listener_count(&self, recipient: Uuid) -> usize {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&recipient)
            .map_or(0, HashMap::len)
    }

    fn remove(&self, recipient: Uuid, id: u64) {
        let mut listeners = self
            .inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(by_id) = listeners.get_mut(&recipient) {
            by_id.remove(&id);
            if by_id.is_empty() {
                listeners.remove(&recipient);
            }
        }
    }
}

/// One listener registration.
pub struct Subscription {
    dispatcher: Dispatcher,
    recipient: Uuid,
    id: u64,
    rx: mpsc::UnboundedReceiver<Confession>,
    active: bool,
}

impl Subscription {
    pub fn recipient(&self) -> Uuid {
        self.recipient
    }

    /// Next confession, or `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<Confession> {
        self.rx.recv().await
    }

    /// Idempotent.
    pub fn unsubscribe(&mut self) {
        if self.active {
            self.active = false;
            self.dispatcher.remove(self.recipient, self.id);
            self.rx.close();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn confession(receiver_id: Uuid, content: &str) -> Confession {
        Confession {
            id: Uuid::new_v4(),
            content: content.to_string(),
            receiver_id,
            sender: None,
            is_anonymous: true,
            is_pinned: false,
            reply: None,
            reply_at: None,
            created_at: Utc::now(),
            edited_at: None,
        }
    }

    #[tokio::test]
    async fn delivers_only_to_the_recipient() {
        let dispatcher = Dispatcher::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let mut alice_sub = dispatcher.subscribe(alice);
        let mut bob_sub = dispatcher.subscribe(bob);

        assert_eq!(dispatcher.publish(alice, &confession(alice, "hi alice")), 1);

        assert_eq!(alice_sub.recv().await.unwrap().content, "hi alice");
        assert!(bob_sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn late_subscribers_get_no_replay() {
        let dispatcher = Dispatcher::new();
        let alice = Uuid::new_v4();

        assert_eq!(dispatcher.publish(alice, &confession(alice, "early")), 0);

        let mut sub = dispatcher.subscribe(alice);
        dispatcher.publish(alice, &confession(alice, "late"));
        assert_eq!(sub.recv().await.unwrap().content, "late");
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let dispatcher = Dispatcher::new();
        let alice = Uuid::new_v4();
        let mut sub = dispatcher.subscribe(alice);
        let _other = dispatcher.subscribe(alice);
        assert_eq!(dispatcher.listener_count(alice), 2);

        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(dispatcher.listener_count(alice), 1);
        assert!(sub.recv().await.is_none());

        drop(sub);
        assert_eq!(dispatcher.listener_count(alice), 1);
    }

    #[tokio::test]
    async fn fans_out_to_many_listeners() {
        let dispatcher = Dispatcher::new();
        let alice = Uuid::new_v4();
        let mut subs: Vec<Subscription> = (0..150).map(|_| dispatcher.subscribe(alice)).collect();

        assert_eq!(dispatcher.publish(alice, &confession(alice, "all")), 150);
        for sub in &mut subs {
            assert_eq!(sub.recv().await.unwrap().content, "all");
        }

        drop(subs);
        assert_eq!(dispatcher.listener_count(alice), 0);
    }
}

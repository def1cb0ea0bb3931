//! Delivery of finalized events to registered listeners.
//!
//! Each listener gets its own bounded channel. Delivery never blocks:
//! a saturated listener loses that event (logged) without affecting
//! the others, and a listener whose receiver is gone is retired on the
//! next delivery.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use tokio::sync::mpsc;

use crate::event::Event;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    tx: mpsc::Sender<Arc<Event>>,
}

pub struct Fanout {
    listeners: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl Fanout {
    pub fn new(buffer: usize) -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            buffer,
        }
    }

    /// Registers a consumer. Events already mid-dispatch when the
    /// listener is added may or may not be observed.
    pub fn add_listener(&self) -> (ListenerId, mpsc::Receiver<Arc<Event>>) {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.buffer);
        self.listeners.lock().unwrap().push(Registration { id, tx });
        (id, rx)
    }

    /// Unregisters a consumer; unknown ids are ignored. A delivery
    /// already in flight may still reach the listener's channel.
    pub fn remove_listener(&self, id: ListenerId) {
        self.listeners.lock().unwrap().retain(|l| l.id != id);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    /// Hands the event to every currently registered listener.
    pub fn deliver(&self, event: Arc<Event>) {
        let mut listeners = self.listeners.lock().unwrap();
        listeners.retain(|listener| match listener.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!(
                    "listener {:?} saturated, dropping event for {}",
                    listener.id,
                    event.key()
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use kernel_common::{Credentials, Namespaces, ProcessKey};

    use super::*;
    use crate::event::{Payload, ProcessSnapshot};

    fn event(pid: i32) -> Arc<Event> {
        Arc::new(Event {
            process: ProcessSnapshot {
                key: ProcessKey::new(pid, 1u64),
                filename: "/bin/true".to_string(),
                args: String::new(),
                creds: Credentials::default(),
                namespaces: Namespaces::default(),
                cgroup_id: 0,
                container: None,
                refcnt: 1,
            },
            parent: None,
            payload: Payload::Exec,
            timestamp: SystemTime::now(),
        })
    }

    #[tokio::test]
    async fn every_listener_receives_once() {
        let fanout = Fanout::new(8);
        let (_ida, mut a) = fanout.add_listener();
        let (_idb, mut b) = fanout.add_listener();

        fanout.deliver(event(1));

        assert_eq!(a.recv().await.unwrap().key().pid, 1);
        assert_eq!(b.recv().await.unwrap().key().pid, 1);
        assert!(a.try_recv().is_err());
        assert!(b.try_recv().is_err());
    }

    #[tokio::test]
    async fn removal_is_idempotent_and_scoped() {
        let fanout = Fanout::new(8);
        let (ida, mut a) = fanout.add_listener();
        let (_idb, mut b) = fanout.add_listener();

        fanout.remove_listener(ida);
        fanout.remove_listener(ida);
        fanout.deliver(event(2));

        assert!(a.try_recv().is_err());
        assert_eq!(b.recv().await.unwrap().key().pid, 2);
    }

    #[tokio::test]
    async fn saturated_listener_does_not_block_others() {
        let fanout = Fanout::new(1);
        let (_ida, mut a) = fanout.add_listener();
        let (_idb, mut b) = fanout.add_listener();

        // b keeps up with the stream, a never consumes
        fanout.deliver(event(1));
        assert_eq!(b.recv().await.unwrap().key().pid, 1);
        fanout.deliver(event(2));

        // the second event is dropped for a only
        assert_eq!(b.recv().await.unwrap().key().pid, 2);
        assert_eq!(a.recv().await.unwrap().key().pid, 1);
        assert!(a.try_recv().is_err());
        assert_eq!(fanout.listener_count(), 2);
    }

    #[tokio::test]
    async fn closed_listener_is_retired() {
        let fanout = Fanout::new(8);
        let (_ida, a) = fanout.add_listener();
        drop(a);
        fanout.deliver(event(1));
        assert_eq!(fanout.listener_count(), 0);
    }
}

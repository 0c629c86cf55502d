//! Publish/subscribe notification bus.
//!
//! Peripherals post value-typed events; subscribers receive them on a
//! dedicated delivery thread through their own channel, so a slow
//! subscriber never stalls the emulation thread. Payloads are owned
//! copies — subscribers must not assume anything about emulator state
//! at delivery time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::debug;

/// Notification topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventId {
    FddMotorStarted,
    FddMotorStopped,
    FddDiskInserted,
    FddDiskEjected,
}

/// Event payloads delivered to subscribers.
#[derive(Debug, Clone)]
pub enum Notification {
    FddMotorStarted {
        drive_id: u8,
    },
    FddMotorStopped {
        drive_id: u8,
    },
    FddDiskInserted {
        emulator_id: String,
        drive_id: u8,
        disk_path: Option<String>,
    },
    FddDiskEjected {
        emulator_id: String,
        drive_id: u8,
        disk_path: Option<String>,
    },
}

impl Notification {
    pub fn id(&self) -> EventId {
        match self {
            Notification::FddMotorStarted { .. } => EventId::FddMotorStarted,
            Notification::FddMotorStopped { .. } => EventId::FddMotorStopped,
            Notification::FddDiskInserted { .. } => EventId::FddDiskInserted,
            Notification::FddDiskEjected { .. } => EventId::FddDiskEjected,
        }
    }
}

type SubscriberMap = Arc<Mutex<HashMap<EventId, Vec<Sender<Notification>>>>>;

/// The bus. Cloneable handle; the delivery thread lives as long as any
/// handle does.
#[derive(Clone)]
pub struct MessageCenter {
    tx: Sender<Notification>,
    subscribers: SubscriberMap,
}

impl MessageCenter {
    pub fn new() -> Self {
        let (tx, rx): (Sender<Notification>, Receiver<Notification>) = unbounded();
        let subscribers: SubscriberMap = Arc::new(Mutex::new(HashMap::new()));

        let delivery_map = Arc::clone(&subscribers);
        thread::Builder::new()
            .name("message-center".into())
            .spawn(move || {
                // Exits when every posting handle is dropped
                while let Ok(event) = rx.recv() {
                    let id = event.id();
                    let mut map = match delivery_map.lock() {
                        Ok(map) => map,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    if let Some(list) = map.get_mut(&id) {
                        // Drop subscribers whose receiving end is gone
                        list.retain(|sub| sub.send(event.clone()).is_ok());
                    }
                }
                debug!("message center delivery thread stopped");
            })
            .expect("spawn message-center thread");

        Self { tx, subscribers }
    }

    /// Subscribe to one topic. The returned receiver gets every future
    /// post for that topic until it is dropped.
    pub fn subscribe(&self, id: EventId) -> Receiver<Notification> {
        let (tx, rx) = unbounded();
        let mut map = match self.subscribers.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.entry(id).or_default().push(tx);
        rx
    }

    /// Post an event for asynchronous delivery. Never blocks.
    pub fn post(&self, event: Notification) {
        let _ = self.tx.send(event);
    }
}

impl Default for MessageCenter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_subscribe_and_post() {
        let center = MessageCenter::new();
        let rx = center.subscribe(EventId::FddMotorStarted);

        center.post(Notification::FddMotorStarted { drive_id: 2 });

        let event = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        match event {
            Notification::FddMotorStarted { drive_id } => assert_eq!(drive_id, 2),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_topic_filtering() {
        let center = MessageCenter::new();
        let motor_rx = center.subscribe(EventId::FddMotorStopped);

        center.post(Notification::FddMotorStarted { drive_id: 0 });
        center.post(Notification::FddMotorStopped { drive_id: 1 });

        let event = motor_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(event, Notification::FddMotorStopped { drive_id: 1 }));
        assert!(motor_rx.try_recv().is_err());
    }
}

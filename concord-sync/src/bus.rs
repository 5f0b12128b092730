//! In-process fan-out with reentrancy protection.
//!
//! Every object and every presence key gets its own channel. Local writes
//! and replayed remote commands publish through the same channel, so a
//! subscriber cannot tell them apart.
//!
//! A publish is a two step affair: [`LocalBus::enter`] claims the channel
//! before the store is touched, and [`PublishGuard::publish`] fans out once
//! the store is consistent again. While a guard is alive the channel is
//! busy; a subscriber that mutates the object that triggered it hits a
//! [`ReentrancyError`] instead of recursing.
//!
//! The bus is single-threaded (`Rc`, `Cell`). Subscribers run on the thread
//! driving the room.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// Subscriber callback. Identity (`Rc::ptr_eq`) is what `unsubscribe` matches.
pub type Subscriber<M> = Rc<dyn Fn(&M)>;

/// Addressable fan-out channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// A list or map, by object id.
    Object(String),
    /// A presence key.
    Presence(String),
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Object(id) => write!(f, "object '{id}'"),
            Channel::Presence(key) => write!(f, "presence '{key}'"),
        }
    }
}

/// Nested publish on a busy channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("No infinite loop: {channel} was modified from inside its own subscriber")]
pub struct ReentrancyError {
    pub channel: Channel,
}

struct Slot<M> {
    busy: Cell<bool>,
    subscribers: RefCell<Vec<Subscriber<M>>>,
}

impl<M> Slot<M> {
    fn new() -> Self {
        Self {
            busy: Cell::new(false),
            subscribers: RefCell::new(Vec::new()),
        }
    }
}

/// Per-room bus.
pub struct LocalBus<M> {
    channels: RefCell<HashMap<Channel, Rc<Slot<M>>>>,
}

impl<M> Default for LocalBus<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> LocalBus<M> {
    pub fn new() -> Self {
        Self {
            channels: RefCell::new(HashMap::new()),
        }
    }

    fn slot(&self, channel: &Channel) -> Rc<Slot<M>> {
        self.channels
            .borrow_mut()
            .entry(channel.clone())
            .or_insert_with(|| Rc::new(Slot::new()))
            .clone()
    }

    /// Register `callback` and hand back the handle to unsubscribe with.
    pub fn subscribe(&self, channel: Channel, callback: Subscriber<M>) -> Subscriber<M> {
        self.slot(&channel)
            .subscribers
            .borrow_mut()
            .push(callback.clone());
        callback
    }

    /// Remove exactly `callback`. Returns whether it was registered.
    pub fn unsubscribe(&self, channel: &Channel, callback: &Subscriber<M>) -> bool {
        let slot = match self.channels.borrow().get(channel) {
            Some(slot) => slot.clone(),
            None => return false,
        };
        let mut subscribers = slot.subscribers.borrow_mut();
        let before = subscribers.len();
        subscribers.retain(|s| !Rc::ptr_eq(s, callback));
        subscribers.len() != before
    }

    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        self.channels
            .borrow()
            .get(channel)
            .map_or(0, |slot| slot.subscribers.borrow().len())
    }

    /// Whether a publish on `channel` is in progress.
    pub fn is_busy(&self, channel: &Channel) -> bool {
        self.channels
            .borrow()
            .get(channel)
            .is_some_and(|slot| slot.busy.get())
    }

    /// Claim `channel` for one publish.
    pub fn enter(&self, channel: &Channel) -> Result<PublishGuard<M>, ReentrancyError> {
        let slot = self.slot(channel);
        if slot.busy.replace(true) {
            return Err(ReentrancyError {
                channel: channel.clone(),
            });
        }
        Ok(PublishGuard {
            channel: channel.clone(),
            slot,
        })
    }

    /// Claim and publish in one go.
    pub fn publish(&self, channel: &Channel, message: &M) -> Result<(), ReentrancyError> {
        self.enter(channel)?.publish(message);
        Ok(())
    }
}

/// Holds a channel busy until dropped.
pub struct PublishGuard<M> {
    channel: Channel,
    slot: Rc<Slot<M>>,
}

impl<M> PublishGuard<M> {
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Deliver `message` to every subscriber, then release the channel.
    pub fn publish(self, message: &M) {
        // Snapshot so callbacks may (un)subscribe.
        let subscribers: Vec<Subscriber<M>> = self.slot.subscribers.borrow().clone();
        for subscriber in &subscribers {
            subscriber(message);
        }
    }
}

impl<M> Drop for PublishGuard<M> {
    fn drop(&mut self) {
        self.slot.busy.set(false);
    }
}

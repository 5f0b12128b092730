//! Caller-facing handles onto one object or presence key.
//!
//! Handles hold no state of their own. Every mutating call returns a fresh
//! handle so callers can chain writes.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;

use crate::bus::Channel;
use crate::command::CommandError;
use crate::crdt::CrdtError;
use crate::envelope::unix_millis;

use super::{RoomClient, RoomError, Subscription, Update};

/// A list in the room's document.
#[derive(Clone)]
pub struct ListClient {
    room: RoomClient,
    id: String,
}

impl std::fmt::Debug for ListClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListClient").field("id", &self.id).finish()
    }
}

impl ListClient {
    pub(super) fn new(room: RoomClient, id: &str) -> Self {
        Self {
            room,
            id: id.to_string(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn channel(&self) -> Channel {
        Channel::Object(self.id.clone())
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.room
            .with_state(|state| state.list(&self.id).and_then(|list| list.get(index)))
    }

    pub fn to_array(&self) -> Vec<Value> {
        self.room.with_state(|state| {
            state
                .list(&self.id)
                .map(|list| list.to_array())
                .unwrap_or_default()
        })
    }

    pub fn len(&self) -> usize {
        self.room
            .with_state(|state| state.list(&self.id).map_or(0, |list| list.len()))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite the element at visible `index`.
    pub fn set(&self, index: usize, value: impl Into<Value>) -> Result<Self, RoomError> {
        let value = value.into();
        self.room
            .mutate_list(&self.id, 1, |list| Ok(vec![list.run_set(index, value)?]))?;
        Ok(self.clone())
    }

    pub fn delete(&self, index: usize) -> Result<Self, RoomError> {
        self.room
            .mutate_list(&self.id, 1, |list| Ok(vec![list.run_delete(index)?]))?;
        Ok(self.clone())
    }

    /// Insert so the value lands at visible `index`.
    pub fn insert_at(&self, index: usize, value: impl Into<Value>) -> Result<Self, RoomError> {
        let value = value.into();
        self.room
            .mutate_list(&self.id, 1, |list| Ok(vec![list.run_insert_at(index, value)?]))?;
        Ok(self.clone())
    }

    /// Insert right after the element at visible `index`.
    pub fn insert_after(&self, index: usize, value: impl Into<Value>) -> Result<Self, RoomError> {
        let Some(at) = index.checked_add(1) else {
            let len = self.len();
            return Err(CommandError::from(CrdtError::IndexOutOfRange { index, len }).into());
        };
        self.insert_at(at, value)
    }

    /// Append values in order.
    pub fn push<I, V>(&self, values: I) -> Result<Self, RoomError>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        if values.is_empty() {
            return Ok(self.clone());
        }
        self.room
            .mutate_list(&self.id, values.len(), |list| list.run_push(values))?;
        Ok(self.clone())
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Update) + 'static,
    {
        self.room.subscribe(self.channel(), callback)
    }
}

/// A map in the room's document.
#[derive(Clone)]
pub struct MapClient {
    room: RoomClient,
    id: String,
}

impl MapClient {
    pub(super) fn new(room: RoomClient, id: &str) -> Self {
        Self {
            room,
            id: id.to_string(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn channel(&self) -> Channel {
        Channel::Object(self.id.clone())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.room
            .with_state(|state| state.map(&self.id).and_then(|map| map.get(key).cloned()))
    }

    pub fn keys(&self) -> Vec<String> {
        self.room
            .with_state(|state| state.map(&self.id).map(|map| map.keys()).unwrap_or_default())
    }

    pub fn to_object(&self) -> BTreeMap<String, Value> {
        self.room.with_state(|state| {
            state
                .map(&self.id)
                .map(|map| map.map().to_object())
                .unwrap_or_default()
        })
    }

    /// Set `key`; `None` deletes it.
    pub fn set(&self, key: &str, value: impl Into<Option<Value>>) -> Result<Self, RoomError> {
        let value = value.into();
        self.room.mutate_map(&self.id, |map| map.run_set(key, value))?;
        Ok(self.clone())
    }

    pub fn delete(&self, key: &str) -> Result<Self, RoomError> {
        self.room.mutate_map(&self.id, |map| map.run_delete(key))?;
        Ok(self.clone())
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Update) + 'static,
    {
        self.room.subscribe(self.channel(), callback)
    }
}

/// One presence key of the room.
#[derive(Clone)]
pub struct PresenceClient {
    room: RoomClient,
    key: String,
}

impl PresenceClient {
    pub(super) fn new(room: RoomClient, key: &str) -> Self {
        Self {
            room,
            key: key.to_string(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn channel(&self) -> Channel {
        Channel::Presence(self.key.clone())
    }

    /// Publish our value with the default TTL. Returns the other actors' live
    /// values.
    pub fn set(&self, value: impl Into<Value>) -> Result<BTreeMap<String, Value>, RoomError> {
        self.room.set_presence(&self.key, value.into(), None)
    }

    pub fn set_with_ttl(
        &self,
        value: impl Into<Value>,
        ttl_secs: u64,
    ) -> Result<BTreeMap<String, Value>, RoomError> {
        self.room
            .set_presence(&self.key, value.into(), Some(Duration::from_secs(ttl_secs)))
    }

    pub fn get_all(&self) -> BTreeMap<String, Value> {
        let now = unix_millis();
        self.room
            .with_state(|state| state.presence().get_all(&self.key, now))
    }

    pub fn get_others(&self) -> BTreeMap<String, Value> {
        let now = unix_millis();
        self.room
            .with_state(|state| state.presence().get_others(&self.key, now))
    }

    pub fn get_mine(&self) -> Option<Value> {
        let now = unix_millis();
        self.room
            .with_state(|state| state.presence().get_mine(&self.key, now))
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Update) + 'static,
    {
        self.room.subscribe(self.channel(), callback)
    }
}

//! Per-user attribute reconciliation.
//!
//! Display names, linked addresses and NFT badges all follow the same
//! shape as membership: an index from user to their latest event, a replay
//! map from event to value, and the confirmed value per user. Each user has
//! at most one outstanding entry; a newer event evicts the older one.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use streamsync_core::{
    AttributeKind, Confirmation, EncryptedData, EventId, StreamId, StreamListener, UserId,
};

/// An encrypted display name, with its plaintext once decrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayName {
    pub encrypted: EncryptedData,
    pub plaintext: Option<String>,
}

impl DisplayName {
    pub fn new(encrypted: EncryptedData) -> Self {
        Self {
            encrypted,
            plaintext: None,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry<V> {
    user_id: UserId,
    value: V,
    pending: bool,
}

/// Everything known about one user's attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeInfo<'a, V> {
    /// Latest value, pending or not.
    pub value: &'a V,
    /// Last confirmed value.
    pub confirmed: Option<&'a V>,
    /// Whether `value` is still waiting for confirmation.
    pub pending: bool,
}

/// Reconciler for one kind of per-user attribute.
#[derive(Debug, Clone)]
pub struct UserAttributeReconciler<V> {
    stream_id: StreamId,
    kind: AttributeKind,

    user_to_event: HashMap<UserId, EventId>,
    events: HashMap<EventId, Entry<V>>,
    confirmed: HashMap<UserId, (EventId, V)>,
}

impl<V: Clone> UserAttributeReconciler<V> {
    pub fn new(stream_id: StreamId, kind: AttributeKind) -> Self {
        Self {
            stream_id,
            kind,
            user_to_event: HashMap::new(),
            events: HashMap::new(),
            confirmed: HashMap::new(),
        }
    }

    pub fn kind(&self) -> AttributeKind {
        self.kind
    }

    /// Record a new value for `user_id`, evicting their previous entry.
    pub fn add_event(
        &mut self,
        event_id: EventId,
        user_id: UserId,
        value: V,
        confirmation: Confirmation,
        notifier: Option<&dyn StreamListener>,
    ) {
        if let Some(previous) = self.user_to_event.insert(user_id, event_id) {
            if previous != event_id {
                self.events.remove(&previous);
            }
        }

        let pending = confirmation.is_pending();
        if !pending {
            self.confirmed.insert(user_id, (event_id, value.clone()));
        }
        self.events.insert(
            event_id,
            Entry {
                user_id,
                value,
                pending,
            },
        );
        self.notify(notifier, &user_id, pending);
    }

    /// Apply an event as it arrives from the stream.
    ///
    /// Confirmed events that were seen as pending are promoted in place.
    /// Confirmed events never seen before become the user's latest value,
    /// unless the user has a newer pending value outstanding.
    pub fn apply(
        &mut self,
        event_id: EventId,
        user_id: UserId,
        value: V,
        confirmation: Confirmation,
        notifier: Option<&dyn StreamListener>,
    ) {
        if confirmation.is_pending() {
            self.add_event(event_id, user_id, value, Confirmation::Pending, notifier);
            return;
        }
        if self.on_confirmed(&event_id, notifier) {
            return;
        }
        let has_newer_pending = self
            .user_to_event
            .get(&user_id)
            .and_then(|latest| self.events.get(latest))
            .map(|entry| entry.pending)
            .unwrap_or(false);
        if has_newer_pending {
            self.confirm_event(event_id, user_id, value, notifier);
        } else {
            self.add_event(event_id, user_id, value, Confirmation::Confirmed, notifier);
        }
    }

    /// Mark a pending event as confirmed.
    ///
    /// When the entry was already evicted by a newer event, only the
    /// confirmed value is updated so the newer pending entry survives.
    pub fn confirm_event(
        &mut self,
        event_id: EventId,
        user_id: UserId,
        value: V,
        notifier: Option<&dyn StreamListener>,
    ) {
        match self.events.get_mut(&event_id) {
            Some(entry) => {
                entry.pending = false;
                let (user_id, value) = (entry.user_id, entry.value.clone());
                self.confirmed.insert(user_id, (event_id, value));
                self.notify(notifier, &user_id, false);
            }
            None => {
                self.confirmed.insert(user_id, (event_id, value));
                self.notify(notifier, &user_id, false);
            }
        }
    }

    /// Mark a known event confirmed. Returns false for unknown events.
    pub fn on_confirmed(&mut self, event_id: &EventId, notifier: Option<&dyn StreamListener>) -> bool {
        let Some(entry) = self.events.get_mut(event_id) else {
            return false;
        };
        entry.pending = false;
        let (user_id, value) = (entry.user_id, entry.value.clone());
        self.confirmed.insert(user_id, (*event_id, value));
        self.notify(notifier, &user_id, false);
        true
    }

    /// Mutate the value stored for `event_id`, keeping the confirmed copy in
    /// step when that event is the confirmed one.
    ///
    /// Returns false when the event is unknown.
    pub fn update_value(
        &mut self,
        event_id: &EventId,
        f: impl Fn(&mut V),
        notifier: Option<&dyn StreamListener>,
    ) -> bool {
        let mut touched = None;
        if let Some(entry) = self.events.get_mut(event_id) {
            f(&mut entry.value);
            touched = Some((entry.user_id, entry.pending));
        }
        for (user_id, (confirmed_id, value)) in self.confirmed.iter_mut() {
            if confirmed_id == event_id {
                f(value);
                touched.get_or_insert((*user_id, false));
            }
        }
        match touched {
            Some((user_id, pending)) => {
                self.notify(notifier, &user_id, pending);
                true
            }
            None => false,
        }
    }

    /// Latest value for `user_id`, pending included.
    pub fn get(&self, user_id: &UserId) -> Option<&V> {
        self.user_to_event
            .get(user_id)
            .and_then(|event_id| self.events.get(event_id))
            .map(|entry| &entry.value)
            .or_else(|| self.confirmed(user_id))
    }

    /// Last confirmed value for `user_id`.
    pub fn confirmed(&self, user_id: &UserId) -> Option<&V> {
        self.confirmed.get(user_id).map(|(_, value)| value)
    }

    pub fn info(&self, user_id: &UserId) -> Option<AttributeInfo<'_, V>> {
        let latest = self
            .user_to_event
            .get(user_id)
            .and_then(|event_id| self.events.get(event_id));
        let confirmed = self.confirmed(user_id);
        match (latest, confirmed) {
            (Some(entry), confirmed) => Some(AttributeInfo {
                value: &entry.value,
                confirmed,
                pending: entry.pending,
            }),
            (None, Some(value)) => Some(AttributeInfo {
                value,
                confirmed: Some(value),
                pending: false,
            }),
            (None, None) => None,
        }
    }

    /// Users with any value.
    pub fn users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .user_to_event
            .keys()
            .chain(self.confirmed.keys())
            .copied()
            .collect();
        users.sort();
        users.dedup();
        users
    }

    /// Event id currently holding `user_id`'s latest value.
    pub fn event_for(&self, user_id: &UserId) -> Option<&EventId> {
        self.user_to_event.get(user_id)
    }

    fn notify(&self, notifier: Option<&dyn StreamListener>, user_id: &UserId, pending: bool) {
        if let Some(listener) = notifier {
            listener.on_attribute_updated(&self.stream_id, self.kind, user_id, pending);
        }
    }
}

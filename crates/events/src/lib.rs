//! WoM Events
//!
//! Explicit publish/subscribe bus shared by the engine components. The bus is
//! built once at startup, handed around as `Arc<EventBus>`, and goes through
//! `Created -> Running -> Draining -> Closed`.
//!
//! Published events are queued for registered [`EventListener`]s (dispatched
//! by [`EventBus::dispatch_pending`] or [`EventBus::drain`]) and broadcast
//! immediately to async subscribers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Event names published by the engine.
pub mod topics {
    pub const HUB_SAVED: &str = "uem.hub.saved";
    pub const HUB_CONNECTED: &str = "uem.hub.connectedToWom";
    pub const HUB_DISCONNECTED: &str = "uem.hub.disconnectedFromWom";
    pub const HUB_STATUS_CHANGED: &str = "uem.hub.status.changed";
    pub const HUB_REPORT_SAVED: &str = "wom.hubReport.saved";
    pub const HUB_REPORT_REWARD_COMPUTED: &str = "uem.HubReportReward.computed";
    pub const REWARD_COMPUTED: &str = "uem.Reward.computed";
    pub const REWARD_CLAIMED: &str = "uem.Reward.claimed";
    pub const EMAIL_SEND_COMMAND: &str = "deed.email.send.command";
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("event bus is {0:?}, not accepting events")]
    NotRunning(BusState),
    #[error("event payload serialization failed: {0}")]
    Serialization(String),
    #[error("listener {listener} failed: {reason}")]
    Listener { listener: String, reason: String },
    #[error("event bus lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, BusError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Created,
    Running,
    Draining,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub payload: serde_json::Value,
}

impl Event {
    /// Decode the payload into a typed value.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| BusError::Serialization(e.to_string()))
    }
}

/// Synchronous consumer of queued events.
pub trait EventListener: Send + Sync {
    fn name(&self) -> &str;
    fn supported_events(&self) -> &[&'static str];
    fn handle_event(&self, event: &Event) -> Result<()>;
}

pub struct EventBus {
    state: Mutex<BusState>,
    queue: Mutex<VecDeque<Event>>,
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
    event_tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(BusState::Created),
            queue: Mutex::new(VecDeque::new()),
            listeners: RwLock::new(Vec::new()),
            event_tx,
        }
    }

    /// Start accepting events. Idempotent while running.
    pub fn init(&self) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| BusError::Poisoned)?;
        match *state {
            BusState::Created => {
                *state = BusState::Running;
                info!("event bus started");
                Ok(())
            }
            BusState::Running => Ok(()),
            other => Err(BusError::NotRunning(other)),
        }
    }

    pub fn state(&self) -> BusState {
        self.state.lock().map(|s| *s).unwrap_or(BusState::Closed)
    }

    /// Queue an event for listeners and broadcast it to subscribers.
    pub fn publish<T: Serialize>(&self, name: &str, payload: &T) -> Result<()> {
        let state = self.state();
        if state != BusState::Running {
            return Err(BusError::NotRunning(state));
        }
        let payload = serde_json::to_value(payload).map_err(|e| BusError::Serialization(e.to_string()))?;
        let event = Event {
            name: name.to_string(),
            payload,
        };
        self.queue
            .lock()
            .map_err(|_| BusError::Poisoned)?
            .push_back(event.clone());
        // No subscribers is not an error.
        let _ = self.event_tx.send(event);
        debug!(event = name, "event published");
        Ok(())
    }

    /// Publish, logging instead of failing. Used where an event is a side
    /// effect of an already committed change.
    pub fn emit<T: Serialize>(&self, name: &str, payload: &T) {
        if let Err(e) = self.publish(name, payload) {
            warn!(event = name, error = %e, "event dropped");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    pub fn add_listener(&self, listener: Arc<dyn EventListener>) -> Result<()> {
        let mut listeners = self.listeners.write().map_err(|_| BusError::Poisoned)?;
        if listeners.iter().any(|l| l.name() == listener.name()) {
            return Ok(());
        }
        debug!(listener = listener.name(), "listener added");
        listeners.push(listener);
        Ok(())
    }

    pub fn remove_listener(&self, name: &str) -> Result<bool> {
        let mut listeners = self.listeners.write().map_err(|_| BusError::Poisoned)?;
        let before = listeners.len();
        listeners.retain(|l| l.name() != name);
        Ok(listeners.len() != before)
    }

    /// Deliver every queued event to the listeners supporting it. Listener
    /// failures are logged. Returns the number of events dequeued.
    pub fn dispatch_pending(&self) -> Result<usize> {
        let pending: Vec<Event> = self
            .queue
            .lock()
            .map_err(|_| BusError::Poisoned)?
            .drain(..)
            .collect();
        let listeners = self.listeners.read().map_err(|_| BusError::Poisoned)?.clone();

        for event in &pending {
            for listener in listeners
                .iter()
                .filter(|l| l.supported_events().contains(&event.name.as_str()))
            {
                if let Err(e) = listener.handle_event(event) {
                    warn!(listener = listener.name(), event = %event.name, error = %e, "listener failed");
                }
            }
        }
        Ok(pending.len())
    }

    /// Stop accepting events and deliver what is queued.
    pub fn drain(&self) -> Result<usize> {
        {
            let mut state = self.state.lock().map_err(|_| BusError::Poisoned)?;
            if *state == BusState::Closed {
                return Ok(0);
            }
            *state = BusState::Draining;
        }
        let delivered = self.dispatch_pending()?;
        info!(delivered, "event bus drained");
        Ok(delivered)
    }

    /// Drain then close. Further publishes are rejected.
    pub fn close(&self) -> Result<()> {
        self.drain()?;
        *self.state.lock().map_err(|_| BusError::Poisoned)? = BusState::Closed;
        info!("event bus closed");
        Ok(())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

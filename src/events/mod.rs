//! 事件总线模块：基于存储发布/订阅的跨进程事件分发。
//!
//! # Event Distribution Module
//!
//! Domain events (new messages, label changes, connection status) are
//! published as JSON envelopes onto named channels of the shared store. Every
//! process holding open SSE streams subscribes to the channels its clients
//! care about and relays what arrives.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`EventBus`] | Publish, subscribe, shared subscriber connection |
//! | [`EventPayload`] | `{event, data, timestamp}` envelope |
//! | [`Channel`] | The four channel namespaces |
//! | [`domain`] | Typed domain events and their routing |
//!
//! Delivery is best-effort and at-most-once: there is no persistence and no
//! retry, and ordering holds only within one channel.

mod bus;
pub mod domain;

pub use bus::{BusStats, EventBus, EventCallback, EventStream, Subscription, SubscriptionId};
pub use domain::{
    ContactLabelsChanged, ContactUpdated, DomainEvent, InstanceStatusChanged, LabelAction,
    MessageAuthor, MessageReceived, MessageSent, SessionLabelsChanged, SessionUpdated,
};

use crate::{Error, ErrorContext, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// The envelope carried on every channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub event: String,
    pub data: Value,
    /// Publish time, epoch milliseconds.
    pub timestamp: u64,
}

impl EventPayload {
    pub fn new(event: impl Into<String>, data: Value, timestamp: u64) -> Self {
        Self {
            event: event.into(),
            data,
            timestamp,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Decode `data` into a typed event.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

const ORG_PREFIX: &str = "org:events:";
const GLOBAL: &str = "global:events";
const INSTANCE_PREFIX: &str = "instance:status:";
const SESSION_PREFIX: &str = "session:events:";

/// A channel in one of the four namespaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// `org:events:<organization id>`
    Organization(String),
    /// `global:events`
    Global,
    /// `instance:status:<connection id>`
    InstanceStatus(String),
    /// `session:events:<session id>`
    Session(String),
}

impl Channel {
    pub fn org(id: impl Into<String>) -> Self {
        Channel::Organization(id.into())
    }

    pub fn session(id: impl Into<String>) -> Self {
        Channel::Session(id.into())
    }

    pub fn instance_status(id: impl Into<String>) -> Self {
        Channel::InstanceStatus(id.into())
    }

    pub fn name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Organization(id) => write!(f, "{}{}", ORG_PREFIX, id),
            Channel::Global => f.write_str(GLOBAL),
            Channel::InstanceStatus(id) => write!(f, "{}{}", INSTANCE_PREFIX, id),
            Channel::Session(id) => write!(f, "{}{}", SESSION_PREFIX, id),
        }
    }
}

impl FromStr for Channel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let with_id = |rest: &str, make: fn(String) -> Channel| {
            if rest.is_empty() {
                Err(Error::validation_with_context(
                    "channel id is empty",
                    ErrorContext::new().with_details(s.to_string()),
                ))
            } else {
                Ok(make(rest.to_string()))
            }
        };
        if s == GLOBAL {
            Ok(Channel::Global)
        } else if let Some(rest) = s.strip_prefix(ORG_PREFIX) {
            with_id(rest, Channel::Organization)
        } else if let Some(rest) = s.strip_prefix(INSTANCE_PREFIX) {
            with_id(rest, Channel::InstanceStatus)
        } else if let Some(rest) = s.strip_prefix(SESSION_PREFIX) {
            with_id(rest, Channel::Session)
        } else {
            Err(Error::validation_with_context(
                "unknown channel namespace",
                ErrorContext::new().with_details(s.to_string()),
            ))
        }
    }
}

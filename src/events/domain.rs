//! Typed domain events and the channels each one is routed to.
//!
//! | Event | Channels |
//! |-------|----------|
//! | `contact.labels.changed`, `contact.updated` | organization (dropped without one) |
//! | `session.labels.changed`, `session.updated` | organization |
//! | `message.received`, `message.sent` | organization and session |
//! | `instance.status.changed` / `status.changed` | organization / connection status |

use super::{bus::Subscription, Channel, EventBus, EventPayload};
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A payload type with a fixed event name.
pub trait DomainEvent: Serialize {
    const NAME: &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelAction {
    Replaced,
    Added,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageAuthor {
    Customer,
    Agent,
    Bot,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactLabelsChanged {
    pub contact_id: String,
    pub action: LabelAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
}

impl DomainEvent for ContactLabelsChanged {
    const NAME: &'static str = "contact.labels.changed";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLabelsChanged {
    pub session_id: String,
    pub action: LabelAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_id: Option<String>,
    pub organization_id: String,
}

impl DomainEvent for SessionLabelsChanged {
    const NAME: &'static str = "session.labels.changed";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactUpdated {
    pub contact_id: String,
    pub field: String,
    pub old_value: Value,
    pub new_value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
}

impl DomainEvent for ContactUpdated {
    const NAME: &'static str = "contact.updated";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdated {
    pub session_id: String,
    pub field: String,
    pub old_value: Value,
    pub new_value: Value,
    pub organization_id: String,
}

impl DomainEvent for SessionUpdated {
    const NAME: &'static str = "session.updated";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReceived {
    pub session_id: String,
    pub message_id: String,
    pub content: String,
    pub author: MessageAuthor,
    pub organization_id: String,
}

impl DomainEvent for MessageReceived {
    const NAME: &'static str = "message.received";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSent {
    pub session_id: String,
    pub message_id: String,
    pub content: String,
    pub organization_id: String,
}

impl DomainEvent for MessageSent {
    const NAME: &'static str = "message.sent";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatusChanged {
    pub connection_id: String,
    pub status: String,
    pub organization_id: String,
}

impl DomainEvent for InstanceStatusChanged {
    const NAME: &'static str = "instance.status.changed";
}

impl InstanceStatusChanged {
    /// Event name on the connection status channel.
    pub const STATUS_CHANNEL_NAME: &'static str = "status.changed";
}

impl EventBus {
    async fn publish_event<E: DomainEvent>(&self, channel: Channel, event: &E) {
        self.publish(&channel.to_string(), E::NAME, event).await;
    }

    async fn publish_event_to_all<E: DomainEvent>(&self, channels: [Channel; 2], event: &E) {
        let names = channels.map(|c| c.to_string());
        let names = [names[0].as_str(), names[1].as_str()];
        self.publish_all(&names, E::NAME, event).await;
    }

    pub async fn emit_contact_labels_changed(&self, event: &ContactLabelsChanged) {
        match &event.organization_id {
            Some(org) => self.publish_event(Channel::org(org), event).await,
            None => tracing::debug!(contact = %event.contact_id, "contact event without organization dropped"),
        }
    }

    pub async fn emit_session_labels_changed(&self, event: &SessionLabelsChanged) {
        self.publish_event(Channel::org(&event.organization_id), event)
            .await;
    }

    pub async fn emit_contact_updated(&self, event: &ContactUpdated) {
        match &event.organization_id {
            Some(org) => self.publish_event(Channel::org(org), event).await,
            None => tracing::debug!(contact = %event.contact_id, "contact event without organization dropped"),
        }
    }

    pub async fn emit_session_updated(&self, event: &SessionUpdated) {
        self.publish_event(Channel::org(&event.organization_id), event)
            .await;
    }

    pub async fn emit_message_received(&self, event: &MessageReceived) {
        let channels = [
            Channel::org(&event.organization_id),
            Channel::session(&event.session_id),
        ];
        self.publish_event_to_all(channels, event).await;
    }

    pub async fn emit_message_sent(&self, event: &MessageSent) {
        let channels = [
            Channel::org(&event.organization_id),
            Channel::session(&event.session_id),
        ];
        self.publish_event_to_all(channels, event).await;
    }

    pub async fn emit_instance_status_changed(&self, event: &InstanceStatusChanged) {
        self.publish_event(Channel::org(&event.organization_id), event)
            .await;
        self.publish(
            &Channel::instance_status(&event.connection_id).to_string(),
            InstanceStatusChanged::STATUS_CHANNEL_NAME,
            event,
        )
        .await;
    }

    /// Publish to the organization named by `data.organizationId`, or to the
    /// global channel when there is none.
    pub async fn emit(&self, event: &str, data: &Value) {
        let channel = match data.get("organizationId").and_then(Value::as_str) {
            Some(org) if !org.is_empty() => Channel::org(org),
            _ => Channel::Global,
        };
        self.publish(&channel.to_string(), event, data).await;
    }

    pub async fn emit_to_channel<T: Serialize + ?Sized>(&self, channel: &Channel, event: &str, data: &T) {
        self.publish(&channel.to_string(), event, data).await;
    }

    pub async fn subscribe_to_org<F>(&self, organization_id: &str, callback: F) -> Result<Subscription>
    where
        F: Fn(EventPayload) + Send + Sync + 'static,
    {
        self.subscribe(&Channel::org(organization_id).to_string(), callback)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn received() -> MessageReceived {
        MessageReceived {
            session_id: "s1".into(),
            message_id: "m1".into(),
            content: "Olá".into(),
            author: MessageAuthor::Customer,
            organization_id: "o1".into(),
        }
    }

    #[test]
    fn test_camel_case_wire_format() {
        let wire = serde_json::to_value(received()).unwrap();
        assert_eq!(
            wire,
            json!({
                "sessionId": "s1",
                "messageId": "m1",
                "content": "Olá",
                "author": "CUSTOMER",
                "organizationId": "o1"
            })
        );
        let labels = ContactLabelsChanged {
            contact_id: "c1".into(),
            action: LabelAction::Added,
            label_ids: None,
            label_id: Some("l1".into()),
            organization_id: None,
        };
        assert_eq!(
            serde_json::to_value(&labels).unwrap(),
            json!({"contactId": "c1", "action": "added", "labelId": "l1"})
        );
    }

    #[tokio::test]
    async fn test_message_received_reaches_org_and_session() {
        let bus = EventBus::new(Arc::new(MemoryStore::new()));
        let mut org = bus.subscribe_stream("org:events:o1").await.unwrap();
        let mut session = bus.subscribe_stream("session:events:s1").await.unwrap();

        bus.emit_message_received(&received()).await;

        let a = org.recv().await.unwrap();
        let b = session.recv().await.unwrap();
        assert_eq!(a.event, "message.received");
        assert_eq!(a, b);
        assert_eq!(a.data_as::<MessageReceived>().unwrap(), received());
    }

    #[tokio::test]
    async fn test_instance_status_uses_two_event_names() {
        let bus = EventBus::new(Arc::new(MemoryStore::new()));
        let mut org = bus.subscribe_stream("org:events:o1").await.unwrap();
        let mut status = bus.subscribe_stream("instance:status:c1").await.unwrap();
        bus.emit_instance_status_changed(&InstanceStatusChanged {
            connection_id: "c1".into(),
            status: "connected".into(),
            organization_id: "o1".into(),
        })
        .await;
        assert_eq!(org.recv().await.unwrap().event, "instance.status.changed");
        assert_eq!(status.recv().await.unwrap().event, "status.changed");
    }

    #[tokio::test]
    async fn test_contact_event_without_org_is_dropped() {
        let bus = EventBus::new(Arc::new(MemoryStore::new()));
        let mut global = bus.subscribe_stream("global:events").await.unwrap();
        bus.emit_contact_updated(&ContactUpdated {
            contact_id: "c1".into(),
            field: "name".into(),
            old_value: json!("A"),
            new_value: json!("B"),
            organization_id: None,
        })
        .await;
        bus.emit("tick", &json!({"n": 1})).await;
        // the first thing on any channel is the generic event
        let first = global.recv().await.unwrap();
        assert_eq!(first.event, "tick");
        assert!(tokio::time::timeout(Duration::from_millis(50), global.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_generic_emit_routes_by_organization() {
        let bus = EventBus::new(Arc::new(MemoryStore::new()));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _sub = bus
            .subscribe_to_org("o7", move |p| {
                let _ = tx.send(p);
            })
            .await
            .unwrap();
        bus.emit("report.ready", &json!({"organizationId": "o7", "id": 3})).await;
        let got = rx.recv().await.unwrap();
        assert_eq!(got.event, "report.ready");
        assert_eq!(got.data["id"], 3);

        bus.emit_to_channel(&Channel::org("o7"), "custom", &json!([1, 2])).await;
        assert_eq!(rx.recv().await.unwrap().data, json!([1, 2]));
    }
}

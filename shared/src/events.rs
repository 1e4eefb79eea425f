//! Payloads pushed to connected listeners, tagged by `type`.

use crate::Point;
use serde::{Deserialize, Serialize};

/// The point shape carried inside change notifications.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PointPayload {
    pub id: i64,
    pub x: i64,
    pub y: i64,
    pub user_id: String,
    pub timestamp: i64,
}

impl From<&Point> for PointPayload {
    fn from(point: &Point) -> Self {
        Self {
            id: point.id,
            x: point.x,
            y: point.y,
            user_id: point.user_id.clone(),
            timestamp: point.created_at_ms,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    BasePointChanged {
        point: PointPayload,
    },
    BasePointDeleted {
        point: PointPayload,
        count: usize,
    },
    #[serde(rename_all = "camelCase")]
    Cleanup {
        initial_count: usize,
        total_base_points: usize,
        total_including_origin: usize,
        timestamp: i64,
        oldest_prime_timestamp: Option<i64>,
    },
    #[serde(rename_all = "camelCase")]
    WorldReset {
        reason: String,
        threshold: usize,
        points_before_reset: usize,
        timestamp: i64,
        oldest_prime_timestamp: Option<i64>,
    },
}

/// Discriminant used to register listeners for one kind of event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    BasePointChanged,
    BasePointDeleted,
    Cleanup,
    WorldReset,
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::BasePointChanged { .. } => EventKind::BasePointChanged,
            ServerEvent::BasePointDeleted { .. } => EventKind::BasePointDeleted,
            ServerEvent::Cleanup { .. } => EventKind::Cleanup,
            ServerEvent::WorldReset { .. } => EventKind::WorldReset,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

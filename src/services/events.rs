//! Event system for moderation operations
//!
//! Provides an event bus for notifying listeners about committed writes.
//! Events are emitted after the transaction commits; the only listener
//! shipped here writes them to the audit log.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use crate::db::ClusterStatus;

/// Moderation events emitted by services
#[derive(Debug, Clone, PartialEq)]
pub enum ModerationEvent {
    // Cluster events
    ClusterCreated {
        cluster_id: i64,
        leader_entity_id: i64,
    },
    ClusterDeleted {
        cluster_id: i64,
        cleared_members: usize,
        deleted_ledger_rows: usize,
    },
    ClusterRenumbered {
        old_id: i64,
        new_id: i64,
    },

    // Membership events
    MemberAdded {
        entity_id: i64,
        cluster_id: i64,
    },
    MemberRemoved {
        entity_id: i64,
        cluster_id: i64,
    },

    // Ledger and report events
    StatusRecorded {
        cluster_id: i64,
        status: ClusterStatus,
        actor_id: i64,
    },
    ReportRecorded {
        cluster_id: i64,
        report_count: i32,
    },
    ReportCountCorrected {
        cluster_id: i64,
        report_count: i32,
    },

    // Registry events
    EntityDeleted {
        entity_id: i64,
        cascaded_cluster: Option<i64>,
    },
    EntityRenamed {
        old_id: i64,
        new_id: i64,
    },
    ActorDeleted {
        actor_id: i64,
    },
    ActorRenamed {
        old_id: i64,
        new_id: i64,
        ledger_rows: usize,
    },

    // Maintenance
    MaintenanceFinished {
        task: &'static str,
        corrected: usize,
    },
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    /// Handle an event
    fn on_event(&self, event: &ModerationEvent);
}

/// Event bus for broadcasting moderation events
pub struct EventBus {
    sender: broadcast::Sender<ModerationEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a new event bus with specified capacity (at least 1)
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.clamp(1, usize::MAX / 2));
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: ModerationEvent) {
        trace!(event = ?event, "Emitting moderation event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<ModerationEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Logging event listener for audit trails
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &ModerationEvent) {
        match event {
            ModerationEvent::ClusterCreated { cluster_id, leader_entity_id } => {
                info!(cluster_id, leader_entity_id, "Cluster created");
            }
            ModerationEvent::ClusterDeleted { cluster_id, cleared_members, deleted_ledger_rows } => {
                info!(cluster_id, cleared_members, deleted_ledger_rows, "Cluster deleted");
            }
            ModerationEvent::StatusRecorded { cluster_id, status, actor_id } => {
                info!(cluster_id, actor_id, status = %status, "Status recorded");
            }
            ModerationEvent::EntityDeleted { entity_id, cascaded_cluster: Some(cluster_id) } => {
                info!(entity_id, cluster_id, "Leader deleted, cluster cascaded");
            }
            ModerationEvent::MaintenanceFinished { task, corrected } => {
                info!(task, corrected, "Maintenance finished");
            }
            _ => {
                debug!(event = ?event, "Moderation event");
            }
        }
    }
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    let listener = LoggingEventListener;

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_event_bus_emit_receive() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        bus.emit(ModerationEvent::StatusRecorded {
            cluster_id: 3,
            status: ClusterStatus::Blacklisted,
            actor_id: 9,
        });

        let event = timeout(Duration::from_millis(100), receiver.recv())
            .await
            .expect("timeout")
            .expect("receive error");

        assert_eq!(
            event,
            ModerationEvent::StatusRecorded {
                cluster_id: 3,
                status: ClusterStatus::Blacklisted,
                actor_id: 9,
            }
        );
    }

    #[test]
    fn test_event_bus_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit(ModerationEvent::ActorDeleted { actor_id: 1 });
    }

    #[tokio::test]
    async fn test_zero_capacity_is_clamped() {
        let bus = EventBus::with_capacity(0);
        let mut receiver = bus.subscribe();
        bus.emit(ModerationEvent::ActorDeleted { actor_id: 4 });
        assert_eq!(receiver.recv().await.unwrap(), ModerationEvent::ActorDeleted { actor_id: 4 });
    }

    #[tokio::test]
    async fn test_logging_listener_stops_when_bus_dropped() {
        let bus = Arc::new(EventBus::with_capacity(8));
        let handle = spawn_logging_listener(bus.clone());
        bus.emit(ModerationEvent::ClusterCreated { cluster_id: 1, leader_entity_id: 1 });
        drop(bus);
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("listener did not stop")
            .unwrap();
    }
}

//! Event Bus: same-module synchronous delivery, cross-module durable
//! queued delivery with at-least-once semantics.
//!
//! Delivery mode is decided once at subscription time from module identity:
//! a listener owned by the module that exports the event type runs Inline
//! (synchronously, in registration order, inside the publishing call); any
//! other listener gets a durable `deliveries` row and is driven by workers
//! through `claim_next`/`ack`/`nack`.
//!
//! Invariants:
//! - queued rows are committed in the same transaction as the event row,
//!   before `publish` returns;
//! - a claim holds a lease with bounded expiry, so at most one worker has a
//!   row InFlight and a crashed worker's claim times out back to Pending;
//! - FIFO per listener: a worker never claims past an earlier undelivered
//!   row for the same listener;
//! - retries back off exponentially and dead-letter after the configured
//!   maximum; dead-lettered rows move only by explicit operator requeue.

use crate::core::db;
use crate::core::descriptor::DescriptorStore;
use crate::core::error::ModguardError;
use crate::core::time;
use colored::Colorize;
use rusqlite::{params, Connection, OptionalExtension};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub type ListenerResult = Result<(), String>;
pub type Listener = Arc<dyn Fn(&DomainEvent) -> ListenerResult + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: String,
    pub event_type: String,
    pub source_module: String,
    pub correlation_id: Option<String>,
    /// Closed, plain-data payload. No live references cross the bus.
    pub payload: JsonValue,
    pub ts: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    Inline,
    Queued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Pending,
    InFlight,
    Delivered,
    DeadLettered,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::InFlight => "inflight",
            DeliveryState::Delivered => "delivered",
            DeliveryState::DeadLettered => "deadlettered",
        }
    }

}

#[derive(Clone)]
struct Subscription {
    subscription_id: String,
    event_type: String,
    listener_id: String,
    owner_module: String,
    mode: DeliveryMode,
    listener: Listener,
}

/// A claimed delivery handed to a worker, with the event it carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedDelivery {
    pub delivery_id: String,
    pub seq: i64,
    pub subscription_id: String,
    pub listener_id: String,
    pub attempt_count: u32,
    pub state: DeliveryState,
    pub event: DomainEvent,
}

/// Flat row view for the operator inspection surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRow {
    pub delivery_id: String,
    pub seq: i64,
    pub event_id: String,
    pub event_type: String,
    pub listener_id: String,
    pub state: String,
    pub attempt_count: u32,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy)]
pub struct BusConfig {
    pub max_attempts: u32,
    pub lease_secs: u64,
    pub backoff_base_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            max_attempts: 5,
            lease_secs: 30,
            backoff_base_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub event_id: String,
    /// Inline listeners invoked synchronously, in registration order.
    pub inline_invoked: usize,
    /// Per-listener diagnostics; one failure never blocks the others.
    pub inline_failures: Vec<String>,
    /// Queued rows durably recorded before publish returned.
    pub queued: usize,
}

/// Serialized access to the event store plus a JSONL audit trail of queue
/// mutations. The bus's one shared mutable surface.
struct QueueBroker {
    db_path: PathBuf,
    audit_log_path: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct QueueAuditEvent {
    ts: String,
    audit_id: String,
    actor: String,
    op: String,
    status: String,
}

impl QueueBroker {
    fn new(root: &Path) -> Self {
        QueueBroker {
            db_path: db::event_store_path(root),
            audit_log_path: root.join("bus.events.jsonl"),
        }
    }

    fn with_conn<F, R>(&self, actor: &str, op: &str, f: F) -> Result<R, ModguardError>
    where
        F: FnOnce(&mut Connection) -> Result<R, ModguardError>,
    {
        static DB_LOCK: Mutex<()> = Mutex::new(());
        let _lock = DB_LOCK.lock().expect("queue broker lock poisoned");

        let mut conn = db::db_connect(&self.db_path.to_string_lossy())?;
        let result = f(&mut conn);

        let status = if result.is_ok() { "success" } else { "error" };
        self.log_event(actor, op, status)?;
        result
    }

    fn log_event(&self, actor: &str, op: &str, status: &str) -> Result<(), ModguardError> {
        use std::fs::OpenOptions;
        use std::io::Write;

        let ev = QueueAuditEvent {
            ts: time::now_epoch_z(),
            audit_id: time::new_event_id(),
            actor: actor.to_string(),
            op: op.to_string(),
            status: status.to_string(),
        };
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.audit_log_path)
            .map_err(ModguardError::IoError)?;
        let line = serde_json::to_string(&ev)
            .map_err(|e| ModguardError::ValidationError(format!("audit encode failed: {}", e)))?;
        writeln!(f, "{}", line).map_err(ModguardError::IoError)?;
        Ok(())
    }
}

pub struct EventBus {
    broker: QueueBroker,
    config: BusConfig,
    subscriptions: Mutex<Vec<Subscription>>,
    /// event_type -> exporting module, from the descriptor store.
    event_owners: FxHashMap<String, String>,
}

impl EventBus {
    /// Open (and initialize if needed) the durable event store under `root`.
    pub fn open(
        root: &Path,
        store: &DescriptorStore,
        config: BusConfig,
    ) -> Result<Self, ModguardError> {
        db::initialize_event_store(root)?;
        let mut event_owners = FxHashMap::default();
        for module in store.modules() {
            for event_type in &module.exported_events {
                event_owners
                    .entry(event_type.clone())
                    .or_insert_with(|| module.name.clone());
            }
        }
        Ok(EventBus {
            broker: QueueBroker::new(root),
            config,
            subscriptions: Mutex::new(Vec::new()),
            event_owners,
        })
    }

    /// Register a listener for `event_type` on behalf of `owner_module`.
    ///
    /// The delivery mode is computed here, once: Inline iff the owner
    /// module is the module exporting the event type. Returns the
    /// subscription id.
    pub fn subscribe(
        &self,
        event_type: &str,
        owner_module: &str,
        listener_id: &str,
        listener: Listener,
    ) -> Result<String, ModguardError> {
        let publisher = self.event_owners.get(event_type).ok_or_else(|| {
            ModguardError::NotFound(format!("event type '{}' is not exported by any module", event_type))
        })?;
        let mode = if publisher == owner_module {
            DeliveryMode::Inline
        } else {
            DeliveryMode::Queued
        };
        let subscription_id = time::new_event_id();
        let mut subs = self.subscriptions.lock().expect("subscription lock poisoned");
        subs.push(Subscription {
            subscription_id: subscription_id.clone(),
            event_type: event_type.to_string(),
            listener_id: listener_id.to_string(),
            owner_module: owner_module.to_string(),
            mode,
            listener,
        });
        Ok(subscription_id)
    }

    pub fn delivery_mode(&self, subscription_id: &str) -> Option<DeliveryMode> {
        let subs = self.subscriptions.lock().expect("subscription lock poisoned");
        subs.iter()
            .find(|s| s.subscription_id == subscription_id)
            .map(|s| s.mode)
    }

    /// Publish a domain event.
    ///
    /// The event row and every queued delivery row commit in a single
    /// transaction before this returns; inline listeners then run in
    /// registration order with per-listener failure isolation.
    pub fn publish(
        &self,
        event_type: &str,
        source_module: &str,
        payload: JsonValue,
        correlation_id: Option<&str>,
    ) -> Result<PublishReceipt, ModguardError> {
        let owner = self.event_owners.get(event_type).ok_or_else(|| {
            ModguardError::NotFound(format!("event type '{}' is not exported by any module", event_type))
        })?;
        if owner != source_module {
            return Err(ModguardError::ValidationError(format!(
                "module '{}' cannot publish '{}' (exported by '{}')",
                source_module, event_type, owner
            )));
        }

        let event = DomainEvent {
            event_id: time::new_event_id(),
            event_type: event_type.to_string(),
            source_module: source_module.to_string(),
            correlation_id: correlation_id.map(|s| s.to_string()),
            payload,
            ts: time::now_epoch_z(),
        };

        let (inline_subs, queued_subs): (Vec<Subscription>, Vec<Subscription>) = {
            let subs = self.subscriptions.lock().expect("subscription lock poisoned");
            subs.iter()
                .filter(|s| s.event_type == event_type)
                .cloned()
                .partition(|s| s.mode == DeliveryMode::Inline)
        };

        // Durability first: the publisher's state change and its event must
        // survive a crash immediately after commit.
        let queued = queued_subs.len();
        self.broker.with_conn(source_module, "bus.publish", |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO events (event_id, event_type, source_module, correlation_id, payload, ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.event_id,
                    event.event_type,
                    event.source_module,
                    event.correlation_id,
                    event.payload.to_string(),
                    event.ts,
                ],
            )?;
            let now = time::now_epoch_z();
            for sub in &queued_subs {
                tx.execute(
                    "INSERT INTO deliveries (delivery_id, event_id, subscription_id, listener_id, state, attempt_count, next_attempt_at, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, 'pending', 0, 0, ?5, ?5)",
                    params![
                        time::new_delivery_id(),
                        event.event_id,
                        sub.subscription_id,
                        sub.listener_id,
                        now,
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })?;

        let mut inline_failures = Vec::new();
        for sub in &inline_subs {
            if let Err(message) = (sub.listener)(&event) {
                let diagnostic = format!(
                    "inline listener '{}' ({}) failed for {}: {}",
                    sub.listener_id, sub.owner_module, event.event_id, message
                );
                eprintln!("{} {}", "bus:".yellow(), diagnostic);
                inline_failures.push(diagnostic);
            }
        }

        Ok(PublishReceipt {
            event_id: event.event_id,
            inline_invoked: inline_subs.len(),
            inline_failures,
            queued,
        })
    }

    /// Claim the next deliverable row for `listener_id`, marking it
    /// InFlight under a lease.
    ///
    /// Expired leases are reclaimed first (counting as a lost attempt).
    /// FIFO per listener: only the oldest undelivered row is considered;
    /// if it is InFlight elsewhere or still backing off, nothing is
    /// claimed.
    pub fn claim_next(&self, listener_id: &str) -> Result<Option<QueuedDelivery>, ModguardError> {
        let config = self.config;
        self.broker.with_conn(listener_id, "bus.claim", |conn| {
            reap_expired_leases(conn, &config)?;

            let now = time::now_epoch_secs() as i64;
            let head = conn
                .query_row(
                    "SELECT d.delivery_id, d.seq, d.subscription_id, d.listener_id, d.state,
                            d.attempt_count, d.next_attempt_at,
                            e.event_id, e.event_type, e.source_module, e.correlation_id, e.payload, e.ts
                     FROM deliveries d JOIN events e ON e.event_id = d.event_id
                     WHERE d.listener_id = ?1 AND d.state IN ('pending', 'inflight')
                     ORDER BY d.seq LIMIT 1",
                    params![listener_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, u32>(5)?,
                            row.get::<_, i64>(6)?,
                            row.get::<_, String>(7)?,
                            row.get::<_, String>(8)?,
                            row.get::<_, String>(9)?,
                            row.get::<_, Option<String>>(10)?,
                            row.get::<_, String>(11)?,
                            row.get::<_, String>(12)?,
                        ))
                    },
                )
                .optional()?;

            let Some((
                delivery_id,
                seq,
                subscription_id,
                listener,
                state,
                attempt_count,
                next_attempt_at,
                event_id,
                event_type,
                source_module,
                correlation_id,
                payload,
                ts,
            )) = head
            else {
                return Ok(None);
            };

            if state != "pending" || next_attempt_at > now {
                return Ok(None);
            }

            let lease_expires = now + config.lease_secs as i64;
            let changed = conn.execute(
                "UPDATE deliveries SET state = 'inflight', lease_expires_at = ?2, updated_at = ?3
                 WHERE delivery_id = ?1 AND state = 'pending'",
                params![delivery_id, lease_expires, time::now_epoch_z()],
            )?;
            if changed == 0 {
                return Ok(None);
            }

            let payload: JsonValue = serde_json::from_str(&payload).map_err(|e| {
                ModguardError::ValidationError(format!(
                    "stored payload for event {} is not valid JSON: {}",
                    event_id, e
                ))
            })?;

            Ok(Some(QueuedDelivery {
                delivery_id,
                seq,
                subscription_id,
                listener_id: listener,
                attempt_count,
                state: DeliveryState::InFlight,
                event: DomainEvent {
                    event_id,
                    event_type,
                    source_module,
                    correlation_id,
                    payload,
                    ts,
                },
            }))
        })
    }

    /// Mark an InFlight delivery Delivered.
    pub fn ack(&self, delivery_id: &str) -> Result<(), ModguardError> {
        self.broker.with_conn("worker", "bus.ack", |conn| {
            let changed = conn.execute(
                "UPDATE deliveries SET state = 'delivered', lease_expires_at = NULL, updated_at = ?2
                 WHERE delivery_id = ?1 AND state = 'inflight'",
                params![delivery_id, time::now_epoch_z()],
            )?;
            if changed == 0 {
                return Err(ModguardError::NotFound(format!(
                    "no inflight delivery '{}'",
                    delivery_id
                )));
            }
            Ok(())
        })
    }

    /// Record a failed attempt: back to Pending with backoff, or
    /// DeadLettered once attempts are exhausted. Returns the new state.
    pub fn nack(&self, delivery_id: &str) -> Result<DeliveryState, ModguardError> {
        let config = self.config;
        self.broker.with_conn("worker", "bus.nack", |conn| {
            let row = conn
                .query_row(
                    "SELECT attempt_count FROM deliveries WHERE delivery_id = ?1 AND state = 'inflight'",
                    params![delivery_id],
                    |r| r.get::<_, u32>(0),
                )
                .optional()?;
            let Some(attempts) = row else {
                return Err(ModguardError::NotFound(format!(
                    "no inflight delivery '{}'",
                    delivery_id
                )));
            };
            let attempts = attempts + 1;
            let state = fail_delivery(conn, delivery_id, attempts, &config)?;
            if state == DeliveryState::DeadLettered {
                eprintln!(
                    "{} delivery {} dead-lettered after {} attempts",
                    "bus:".yellow(),
                    delivery_id,
                    attempts
                );
            }
            Ok(state)
        })
    }

    /// Explicit operator action: return a DeadLettered delivery to Pending
    /// with a fresh attempt budget. The only path out of dead-letter.
    pub fn requeue(&self, delivery_id: &str) -> Result<(), ModguardError> {
        self.broker.with_conn("operator", "bus.requeue", |conn| {
            requeue_in_conn(conn, delivery_id)
        })
    }

    /// Drive a worker loop for one listener until the queue head is
    /// exhausted: claim, invoke the subscribed listener, ack/nack.
    /// Returns the number of deliveries acknowledged.
    pub fn drain(&self, listener_id: &str) -> Result<u32, ModguardError> {
        let mut delivered = 0u32;
        loop {
            let Some(claimed) = self.claim_next(listener_id)? else {
                return Ok(delivered);
            };
            let listener = {
                let subs = self.subscriptions.lock().expect("subscription lock poisoned");
                subs.iter()
                    .find(|s| s.subscription_id == claimed.subscription_id)
                    .map(|s| s.listener.clone())
            };
            let Some(listener) = listener else {
                // Subscription vanished (listener deregistered between runs).
                self.nack(&claimed.delivery_id)?;
                return Ok(delivered);
            };
            match listener(&claimed.event) {
                Ok(()) => {
                    self.ack(&claimed.delivery_id)?;
                    delivered += 1;
                }
                Err(message) => {
                    eprintln!(
                        "{} listener '{}' failed for {}: {}",
                        "bus:".yellow(),
                        listener_id,
                        claimed.event.event_id,
                        message
                    );
                    let state = self.nack(&claimed.delivery_id)?;
                    if state == DeliveryState::Pending {
                        // Still backing off; the next drain picks it up.
                        return Ok(delivered);
                    }
                }
            }
        }
    }
}

/// Revert expired InFlight leases to Pending, counting the lost lease as a
/// failed attempt and dead-lettering rows past the budget.
fn reap_expired_leases(conn: &mut Connection, config: &BusConfig) -> Result<(), ModguardError> {
    let now = time::now_epoch_secs() as i64;
    let expired: Vec<(String, u32)> = {
        let mut stmt = conn.prepare(
            "SELECT delivery_id, attempt_count FROM deliveries
             WHERE state = 'inflight' AND lease_expires_at IS NOT NULL AND lease_expires_at <= ?1",
        )?;
        let rows = stmt.query_map(params![now], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, u32>(1)?))
        })?;
        rows.collect::<Result<Vec<_>, _>>()?
    };
    for (delivery_id, attempts) in expired {
        let state = fail_delivery(conn, &delivery_id, attempts + 1, config)?;
        if state == DeliveryState::DeadLettered {
            eprintln!(
                "{} delivery {} dead-lettered after expired lease",
                "bus:".yellow(),
                delivery_id
            );
        }
    }
    Ok(())
}

fn fail_delivery(
    conn: &Connection,
    delivery_id: &str,
    attempts: u32,
    config: &BusConfig,
) -> Result<DeliveryState, ModguardError> {
    let now = time::now_epoch_secs() as i64;
    if attempts >= config.max_attempts {
        conn.execute(
            "UPDATE deliveries SET state = 'deadlettered', attempt_count = ?2,
                    lease_expires_at = NULL, updated_at = ?3
             WHERE delivery_id = ?1",
            params![delivery_id, attempts, time::now_epoch_z()],
        )?;
        return Ok(DeliveryState::DeadLettered);
    }
    let backoff = (config.backoff_base_secs as i64) << (attempts.saturating_sub(1).min(16));
    conn.execute(
        "UPDATE deliveries SET state = 'pending', attempt_count = ?2,
                lease_expires_at = NULL, next_attempt_at = ?3, updated_at = ?4
         WHERE delivery_id = ?1",
        params![delivery_id, attempts, now + backoff, time::now_epoch_z()],
    )?;
    Ok(DeliveryState::Pending)
}

fn requeue_in_conn(conn: &Connection, delivery_id: &str) -> Result<(), ModguardError> {
    let changed = conn.execute(
        "UPDATE deliveries SET state = 'pending', attempt_count = 0, next_attempt_at = 0,
                lease_expires_at = NULL, updated_at = ?2
         WHERE delivery_id = ?1 AND state = 'deadlettered'",
        params![delivery_id, time::now_epoch_z()],
    )?;
    if changed == 0 {
        return Err(ModguardError::NotFound(format!(
            "no dead-lettered delivery '{}'",
            delivery_id
        )));
    }
    Ok(())
}

/// Operator surface: list deliveries in a given state (all states when
/// `state` is `None`), newest-last.
pub fn list_deliveries(
    root: &Path,
    state: Option<DeliveryState>,
) -> Result<Vec<DeliveryRow>, ModguardError> {
    let db_path = db::event_store_path(root);
    if !db_path.exists() {
        return Ok(Vec::new());
    }
    let conn = db::db_connect(&db_path.to_string_lossy())?;
    let mut sql = String::from(
        "SELECT d.delivery_id, d.seq, d.event_id, e.event_type, d.listener_id, d.state,
                d.attempt_count, d.updated_at
         FROM deliveries d JOIN events e ON e.event_id = d.event_id",
    );
    if state.is_some() {
        sql.push_str(" WHERE d.state = ?1");
    }
    sql.push_str(" ORDER BY d.seq");

    let map_row = |r: &rusqlite::Row<'_>| {
        Ok(DeliveryRow {
            delivery_id: r.get(0)?,
            seq: r.get(1)?,
            event_id: r.get(2)?,
            event_type: r.get(3)?,
            listener_id: r.get(4)?,
            state: r.get(5)?,
            attempt_count: r.get(6)?,
            updated_at: r.get(7)?,
        })
    };

    let mut stmt = conn.prepare(&sql)?;
    let rows = match state {
        Some(s) => stmt.query_map(params![s.as_str()], map_row)?,
        None => stmt.query_map([], map_row)?,
    };
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Operator surface: requeue a dead-lettered delivery without a live bus.
pub fn requeue_delivery(root: &Path, delivery_id: &str) -> Result<(), ModguardError> {
    let db_path = db::event_store_path(root);
    let conn = db::db_connect(&db_path.to_string_lossy())?;
    requeue_in_conn(&conn, delivery_id)
}

/// Operator surface: per-state delivery counts.
pub fn queue_stats(root: &Path) -> Result<Vec<(String, u32)>, ModguardError> {
    let db_path = db::event_store_path(root);
    if !db_path.exists() {
        return Ok(Vec::new());
    }
    let conn = db::db_connect(&db_path.to_string_lossy())?;
    let mut stmt = conn.prepare(
        "SELECT state, COUNT(*) FROM deliveries GROUP BY state ORDER BY state",
    )?;
    let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, u32>(1)?)))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

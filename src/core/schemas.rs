//! Centralized database schema definitions for the durable event store.
//!
//! The event store is a single SQLite database holding two tables:
//! 1. `events`: immutable published domain events.
//! 2. `deliveries`: per-(subscription, event) queued delivery rows driving
//!    the at-least-once state machine (pending → inflight → delivered /
//!    deadlettered).

pub const EVENT_STORE_DB_NAME: &str = "events.db";

pub const EVENTS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS events (
        event_id TEXT PRIMARY KEY,
        event_type TEXT NOT NULL,
        source_module TEXT NOT NULL,
        correlation_id TEXT,
        payload TEXT NOT NULL,
        ts TEXT NOT NULL
    )
";

pub const DELIVERIES_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS deliveries (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        delivery_id TEXT NOT NULL UNIQUE,
        event_id TEXT NOT NULL REFERENCES events(event_id),
        subscription_id TEXT NOT NULL,
        listener_id TEXT NOT NULL,
        state TEXT NOT NULL DEFAULT 'pending',
        attempt_count INTEGER NOT NULL DEFAULT 0,
        lease_expires_at INTEGER,
        next_attempt_at INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
";

pub const DELIVERIES_LISTENER_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_deliveries_listener_state ON deliveries(listener_id, state)";

pub const DELIVERIES_EVENT_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_deliveries_event ON deliveries(event_id)";

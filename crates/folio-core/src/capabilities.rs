//! Capability traits the core consumes
//!
//! The core never talks to authentication, audit sinks, schedulers, or
//! schema validators directly; it receives them as injected capabilities.
//! Default implementations (`AllowAll`, `NullAuditLogger`, `ThreadTimer`)
//! cover embedding hosts that don't care.

use crate::change::ResourceType;
use crate::ttl::now_millis;
use crate::types::Document;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

// ============================================================================
// Authorization
// ============================================================================

/// What a permission check is being asked about.
#[derive(Debug, Clone)]
pub struct ResourceDescriptor {
    /// Scope granularity
    pub resource_type: ResourceType,
    /// Database name, when scoped
    pub database: Option<String>,
    /// Collection name, when scoped
    pub collection: Option<String>,
    /// Document id, when scoped
    pub document_id: Option<String>,
    /// Document payload, for data-dependent policies
    pub data: Option<Document>,
}

/// Action being authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthAction {
    /// Read a change or document
    Read,
    /// Create or update a subscription
    Subscribe,
}

/// Outcome of a permission check.
#[derive(Debug, Clone)]
pub struct PermissionDecision {
    /// Whether the action is allowed
    pub allowed: bool,
    /// Optional explanation, surfaced on denial
    pub reason: Option<String>,
}

impl PermissionDecision {
    /// An allow decision.
    pub fn allow() -> Self {
        PermissionDecision {
            allowed: true,
            reason: None,
        }
    }

    /// A deny decision with a reason.
    pub fn deny(reason: impl Into<String>) -> Self {
        PermissionDecision {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Authorization capability consumed by the subscription core.
pub trait Authorization: Send + Sync {
    /// Check whether `user` may perform `action` on `resource`.
    fn check_permission(
        &self,
        user: &str,
        resource: &ResourceDescriptor,
        action: AuthAction,
    ) -> PermissionDecision;
}

/// Permissive default policy.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authorization for AllowAll {
    fn check_permission(
        &self,
        _user: &str,
        _resource: &ResourceDescriptor,
        _action: AuthAction,
    ) -> PermissionDecision {
        PermissionDecision::allow()
    }
}

// ============================================================================
// Audit logging
// ============================================================================

/// One audit trail entry.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    /// Event kind, e.g. `subscription_created`
    pub kind: String,
    /// Subject (user or subscription id), when applicable
    pub subject: Option<String>,
    /// Structured details
    pub detail: Document,
    /// Epoch milliseconds
    pub timestamp: u64,
}

impl AuditEvent {
    /// Build an event stamped with the current time.
    pub fn new(kind: impl Into<String>, subject: Option<String>, detail: Document) -> Self {
        AuditEvent {
            kind: kind.into(),
            subject,
            detail,
            timestamp: now_millis(),
        }
    }
}

/// Audit sink capability. Best-effort: implementations must never fail the
/// caller.
pub trait AuditLogger: Send + Sync {
    /// Record one audit event.
    fn log(&self, event: AuditEvent);
}

/// Audit sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuditLogger;

impl AuditLogger for NullAuditLogger {
    fn log(&self, _event: AuditEvent) {}
}

/// Audit sink that forwards to `tracing` at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditLogger;

impl AuditLogger for TracingAuditLogger {
    fn log(&self, event: AuditEvent) {
        tracing::info!(
            kind = %event.kind,
            subject = event.subject.as_deref().unwrap_or("-"),
            detail = %event.detail,
            "audit"
        );
    }
}

// ============================================================================
// Interval timer
// ============================================================================

/// Handle keeping a scheduled callback alive; dropping it stops the ticks.
pub struct TimerGuard {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TimerGuard {
    /// Guard over a stop flag without an owned thread (manual timers).
    pub fn flag_only(stop: Arc<AtomicBool>) -> Self {
        TimerGuard { stop, handle: None }
    }

    /// Stop the ticks without waiting for drop.
    pub fn cancel(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Injected scheduler capability: "tick me every N ms".
///
/// Replaces cron strings; the core never owns a global scheduler.
pub trait IntervalTimer: Send + Sync {
    /// Invoke `tick` every `period` until the returned guard is dropped.
    fn every(&self, period: Duration, tick: Box<dyn FnMut() + Send>) -> TimerGuard;
}

/// Thread-backed timer. One thread per schedule; the thread polls its stop
/// flag every 10ms so guard drops stay responsive.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadTimer;

impl IntervalTimer for ThreadTimer {
    fn every(&self, period: Duration, mut tick: Box<dyn FnMut() + Send>) -> TimerGuard {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            let poll = Duration::from_millis(10).min(period);
            let mut last = Instant::now();
            while !stop_thread.load(Ordering::SeqCst) {
                std::thread::sleep(poll);
                if stop_thread.load(Ordering::SeqCst) {
                    break;
                }
                if last.elapsed() >= period {
                    tick();
                    last = Instant::now();
                }
            }
        });
        TimerGuard {
            stop,
            handle: Some(handle),
        }
    }
}

type ManualSlot = (Arc<AtomicBool>, Box<dyn FnMut() + Send>);

/// Test timer: callbacks fire only when `fire()` is called.
#[derive(Default)]
pub struct ManualTimer {
    slots: Mutex<Vec<ManualSlot>>,
}

impl ManualTimer {
    /// New manual timer with no registered callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every still-active callback once.
    pub fn fire(&self) {
        let mut slots = self.slots.lock();
        slots.retain(|(stop, _)| !stop.load(Ordering::SeqCst));
        for (_, tick) in slots.iter_mut() {
            tick();
        }
    }
}

impl IntervalTimer for ManualTimer {
    fn every(&self, _period: Duration, tick: Box<dyn FnMut() + Send>) -> TimerGuard {
        let stop = Arc::new(AtomicBool::new(false));
        self.slots.lock().push((Arc::clone(&stop), tick));
        TimerGuard::flag_only(stop)
    }
}

// ============================================================================
// Schema validation
// ============================================================================

/// JSON-schema validation stays an external collaborator; the engine only
/// calls through this trait when a collection configures validation.
pub trait SchemaValidator: Send + Sync {
    /// Validate a document; the message becomes a `Validation` error.
    fn validate(&self, doc: &Document) -> Result<(), String>;
}

impl<F> SchemaValidator for F
where
    F: Fn(&Document) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, doc: &Document) -> Result<(), String> {
        self(doc)
    }
}

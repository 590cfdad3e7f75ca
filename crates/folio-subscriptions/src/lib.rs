//! The FolioDB change-notification core
//!
//! Routes committed change records to interested subscribers:
//!
//! - `query`: parse, validate, and optimize subscription queries
//! - `filter`: scope matching, filter evaluation, cached permissions
//! - `connection`: the connection registry with per-user caps
//! - `engine`: subscription lifecycle and change routing
//! - `dispatcher`: per-connection batching, throttling, and retry
//!
//! The engine implements `ChangeSink`, so a collection publishes straight
//! into it. Delivery is best-effort and per-connection ordered within a
//! batch; one subscription's failure never blocks the others.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod engine;
pub mod filter;
pub mod query;

pub use config::{
    ConnectionsConfig, FilteringConfig, LimitsConfig, NotificationsConfig, QueryConfig,
    SubscriptionsConfig,
};
pub use connection::{Connection, ConnectionRegistry, Protocol, ReadyState};
pub use dispatcher::{
    DispatcherStats, MessageFormat, Notification, NotificationDispatcher, Priority, Transport,
};
pub use engine::{
    EngineStats, InitialDataProvider, Subscription, SubscriptionEngine, SubscriptionStatus,
    UserDirectory,
};
pub use filter::{matches_subscription_scope, ChangeFilter};
pub use query::{
    CustomEvaluator, FieldOp, FilterSpec, ParsedFilter, ParsedQuery, QueryParser,
    SubscriptionQuery, UserOp,
};

//! Rate-limited SMS dispatcher.
//!
//! A single background worker drains the outbox ([`store::MessageStore`])
//! through a gateway ([`sender::TransportSender`]), pacing itself with the
//! tiered admission controller from `courier-limiter`.

pub mod dispatch;
pub mod retry;
pub mod sender;
pub mod store;

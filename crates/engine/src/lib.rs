//! Fan-out engine: turns one detected change event into zero-or-more
//! durable, uniquely-keyed pending notifications.
//!
//! Pipeline per event: [`audience`] resolves the recipient list,
//! [`composer`] renders a message variant per recipient, [`maker`]
//! materializes the queue rows and flips the event's processing state.
//! [`pipeline`] orchestrates the three over the change log.

pub mod audience;
pub mod composer;
pub mod maker;
pub mod pipeline;

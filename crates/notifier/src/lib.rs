//! Delivery side of the pipeline: drains the pending-notification queue
//! through the rate-limited Telegram Bot API.

pub mod telegram;
pub mod worker;

pub mod dlq;
pub mod events;
pub mod health;
pub mod inbox;
pub mod subscriptions;

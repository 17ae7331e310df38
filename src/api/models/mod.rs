pub mod dlq;
pub mod events;
pub mod inbox;
pub mod pagination;
pub mod subscriptions;

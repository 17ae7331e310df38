pub mod api_keys;
pub mod deliveries;
pub mod events;
pub mod subscriptions;

pub mod api_keys;
pub mod deliveries;
pub mod events;
pub mod subscriptions;

pub use api_keys::ApiKeys;
pub use deliveries::Deliveries;
pub use events::Events;
pub use subscriptions::Subscriptions;

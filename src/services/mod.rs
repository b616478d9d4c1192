pub mod backend;
pub mod channel;
pub mod delivery_poller;
pub mod events;
pub mod location_tracking;
pub mod notification_store;
pub mod router;
pub mod stomp;

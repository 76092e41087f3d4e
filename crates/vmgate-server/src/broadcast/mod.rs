//! Live VM status fan-out for `/ws/vm-status` subscribers.

pub mod hub;
pub mod subscriber;

pub use hub::{HubConfig, HubLoop, StatusHub, SubscriberId};
pub use subscriber::{serve_subscriber, Subscriber, WsSubscriber};

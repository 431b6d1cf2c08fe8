#![doc = "Module kernel, message bus, timer wheel, and IPHB heartbeat broker."]

pub mod bus;
pub mod endpoint;
pub mod iphb;
pub mod message;
pub mod timer;

pub use bus::{Bus, BusContext, Module, SharedModule};
pub use endpoint::{Endpoint, EndpointId};
pub use iphb::{IphbBroker, SubscriptionId};
pub use message::{Message, MessageKind};
pub use timer::{TimerHandle, TimerId, TimerWheel};

//! Subscriber identity, filtering and registry records.

mod record;
mod reference;

pub use record::{SubscriberRecord, SubscriptionSet};
pub use reference::{ActorTarget, ServiceTarget, SubscriberReference, SubscriberTarget};

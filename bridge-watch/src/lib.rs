pub mod manager;

pub use manager::{
    DataCallback, ErrorCallback, Subscription, SubscriptionManager, SubscriptionStats,
};

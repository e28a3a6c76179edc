pub mod worker;

pub use worker::{DeliveryOutcome, DeliveryWorker};

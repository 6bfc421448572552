//! Test doubles for exercising the transport stack without a broker.

pub mod mocks;

pub use mocks::{MockMqttClient, PublishRecord};

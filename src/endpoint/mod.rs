//! Audio endpoints and the registries that name them

pub mod hub;
pub mod pipeline;
pub mod registry;

pub use hub::EndpointHub;
pub use pipeline::{AudioEndpoint, EndpointInfo};
pub use registry::{EndpointRegistry, Identified, Identity};

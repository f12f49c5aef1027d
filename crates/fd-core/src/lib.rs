pub mod catalog;
pub mod payload;

pub use catalog::{EndpointParams, ModelCatalog, ModelEntry};
pub use payload::{GenerationMode, ImageSize, Payload, PayloadDraft, PayloadError};

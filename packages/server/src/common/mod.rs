pub mod types;

pub use types::{ApiEnvelope, ApiError};

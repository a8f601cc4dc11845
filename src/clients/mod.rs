pub mod http_tier_client;
pub mod llm_client;
pub mod tier_backend;

pub use http_tier_client::HttpTier;
pub use llm_client::VisionLlmTier;
pub use tier_backend::{OfflineTier, TierAnswer, TierBackend, TierItem, TierRequest, TierResponse};

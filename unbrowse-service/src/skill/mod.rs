//! Skill model, generation, verification, storage, and marketplace access

pub mod generate;
pub mod manifest;
pub mod market;
pub mod store;
pub mod verify;

pub use generate::{diff_skills, generate_skill, merge_skills, version_hash};
pub use manifest::{
    slugify, DiscoveryCost, ExecutionType, Lifecycle, SkillEndpoint, SkillManifest,
    VerificationStatus,
};
pub use market::{MarketplaceClient, SearchHit};
pub use store::{AuthFile, MarketplaceRef, SkillStore, StoreRefreshSink};
pub use verify::{verify_endpoints, VerificationSummary};

//! Typed persistence for codebases, analyses, test inventories, spec documents,
//! usage, and subscriptions. See spec.md §3 (Data Model) and §4.9 (Storage).
//!
//! Storage exclusively owns all entity writes; other components read through
//! these repository traits and never hold row references across a transaction
//! boundary.

pub mod error;
pub mod models;

pub use error::{Error, Result};

pub use models::analysis::{Analysis, AnalysisRepository, AnalysisStatus, NewAnalysis, PgAnalysisRepository};
pub use models::cache::{
    BehaviorCacheEntry, BehaviorCacheRepository, ClassificationCacheEntry, ClassificationCacheRepository,
    PgBehaviorCacheRepository, PgClassificationCacheRepository,
};
pub use models::codebase::{Codebase, CodebaseRepository, NewCodebase, PgCodebaseRepository};
pub use models::history::{
    PgUserAnalysisHistoryRepository, PgUserSpecviewHistoryRepository, UserAnalysisHistoryEntry,
    UserAnalysisHistoryRepository, UserSpecviewHistoryEntry, UserSpecviewHistoryRepository,
};
pub use models::spec_document::{
    NewBehavior, NewDocumentTree, NewDomain, NewFeature, PgSpecDocumentRepository, SpecBehavior, SpecDocument,
    SpecDocumentRepository, SpecDomain, SpecFeature,
};
pub use models::subscription::{Plan, PgSubscriptionRepository, Subscription, SubscriptionRepository, SubscriptionStatus};
pub use models::test_tree::{
    CaseStatus, FileInventory, NewCase, NewSuite, PgTestTreeRepository, TestCase, TestFile, TestSuite,
    TestTreeRepository,
};
pub use models::usage::{NewUsageEvent, PgUsageEventRepository, UsageEvent, UsageEventRepository, UsageEventType};

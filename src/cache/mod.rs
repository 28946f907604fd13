//! Two-tier result caching: a fingerprint-keyed LRU in front of the
//! reasoning backend and a revision-stamped cache in front of event queries.

pub mod query_cache;
pub mod response_cache;

pub use query_cache::{QueryKey, QueryLookup, QueryResultCache};
pub use response_cache::{fingerprint, CacheStats, CostRecord, ResponseCache};

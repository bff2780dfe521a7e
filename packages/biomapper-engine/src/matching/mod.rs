//! Matching subsystem
//!
//! - `efficient`: generic index/join primitives (hash, merge, partitioned)
//! - `composite`: separator-delimited composite identifiers
//! - `bidirectional`: reverse-lookup validation of forward matches

pub mod bidirectional;
pub mod composite;
pub mod efficient;
pub mod record;

pub use bidirectional::{
    BidirectionalValidator, IdNormalizer, ValidatedMatch, ValidationReport, ValidationStatus,
};
pub use composite::{CompositeKeyResolver, CompositeMatchReport};
pub use efficient::{
    build_index, chunked_process, hash_partitioned_join, match_with_index, merge_join,
    set_intersection_match, sorted_merge_join, MatchIndex, SetMatch,
};
pub use record::{IdMatch, MatchRecord, MatchType};

//! Bulk resolution of identities and conditional match URLs.
//!
//! Both resolvers answer a whole bundle with a single store query and record
//! every answer, including `NotFound`, in the [`TransactionCaches`](crate::cache::TransactionCaches)
//! so entry application never asks the store the same question twice.

mod conditional;
mod identity;
mod match_url;

pub use conditional::{ConditionalMatchResolver, MatchReport, MatchUrlToResolve, partition_predicate};
pub use identity::{IdentityReport, IdentityResolver};
pub use match_url::{
    MatchPredicate, MatchUrlParser, ParsedMatchUrl, SearchParamRegistry, SingleTokenMatch,
    TokenValue,
};

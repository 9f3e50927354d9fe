//! Secondary index support.
//!
//! - [`IndexExtractor`] derives index values from a payload
//! - [`SearchHasher`] computes the token hashes conditional matching looks up

mod extractor;
mod hash;

pub use extractor::{BasicIndexExtractor, ExtractedIndex, IndexExtractor};
pub use hash::SearchHasher;

//! Classification engine
//!
//! Maps a header record and a policy to a keep/move verdict. Pure and
//! stateless, so it can run on any number of workers at once.

mod engine;

pub use engine::{classify, domain_matches};

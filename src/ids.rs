//! Opaque identifier generation for customers, locks, and stream
//! correlation.

use rand::distributions::Alphanumeric;
use rand::Rng;

/// A random alphanumeric identifier of the given length.
pub fn generate(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

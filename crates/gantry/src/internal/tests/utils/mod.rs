pub mod config;
pub mod env;

use crate::internal::common::bitmap::Bitmap;

#[allow(unused)]
pub fn enable_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Indices of the set bits, for readable assertions.
pub fn bits(bitmap: &Bitmap) -> Vec<usize> {
    bitmap.iter().collect()
}

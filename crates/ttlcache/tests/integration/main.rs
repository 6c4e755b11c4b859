// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod coalescer;
pub mod filesystem;

pub use utils::*;

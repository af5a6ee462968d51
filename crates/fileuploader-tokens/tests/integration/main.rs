// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod correlator;
pub mod tokens;
pub mod uploads;

pub use utils::*;

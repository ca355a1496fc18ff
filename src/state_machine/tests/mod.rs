//! Engine scenario tests and their utilities.

mod cancellation;
pub mod utils;

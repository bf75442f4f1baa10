//! Error handling foundation for switchyard.
//!
//! Only the `Result` alias lives here. Each crate defines its own error
//! enums; host-facing operations wrap them in a `rootcause::Report` so
//! callers see the layer the failure came from.

use rootcause::Report;

/// A Result type alias using rootcause's Report for error handling.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;

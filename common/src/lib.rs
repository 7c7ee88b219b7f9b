//! This library shares some common code amongst all atelier modules.
//!

mod fsutil;
mod logging;

pub use fsutil::*;
pub use logging::*;

/// Return crate name and version.
///
pub fn version() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

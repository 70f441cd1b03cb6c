pub mod hop;
pub mod result;
pub mod snapshot;
pub mod stats;

pub use hop::*;
pub use result::*;
pub use snapshot::*;
pub use stats::*;

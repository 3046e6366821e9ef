pub mod instrument;
pub mod intent;
pub mod portfolio;
pub mod signal;

pub use instrument::*;
pub use intent::*;
pub use portfolio::*;
pub use signal::*;

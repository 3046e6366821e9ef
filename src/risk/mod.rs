pub mod emergency;
pub mod gate;
pub mod sizing;

pub use emergency::{EmergencyReason, EmergencyStop, EmergencyState};
pub use gate::{RiskContext, RiskGate};
pub use sizing::{size_order, target_notional, SizedOrder};

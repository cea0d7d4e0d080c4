// =============================================================================
// Exit subsystem — tiered decision engine + monitor worker
// =============================================================================

pub mod decision;
pub mod monitor;

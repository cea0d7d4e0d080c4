// =============================================================================
// HTTP API — REST endpoints + realtime WebSocket
// =============================================================================

pub mod rest;
pub mod ws;

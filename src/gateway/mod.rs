//! Gateway server implementation

pub mod gate;
mod router;
mod server;

pub use gate::{GateDecision, TrustGate, trust_gate_middleware};
pub use router::{AppState, create_router};
pub use server::Gateway;

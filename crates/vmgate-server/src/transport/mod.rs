pub mod websocket;

pub use websocket::{NegotiationPhase, PassthroughPhase};

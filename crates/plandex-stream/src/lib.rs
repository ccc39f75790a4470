//! Plan stream lifecycle: framing, the pure state machine and the driver that
//! feeds UI events from a server or provider stream.

pub mod driver;
pub mod frame;
pub mod fsm;
pub mod message;

pub use driver::{
    ContextLoader, StreamHandle, StreamOptions, StreamOutcome, StreamSession, UiEvent,
    active_branches, reconnect, start_stream,
};
pub use frame::{Frame, FrameDecoder, Sentinel, encode_record, parse_record};
pub use fsm::{InvalidTransition, StreamEvent, StreamState, step};
pub use message::{BuildInfo, ModelErrorInfo, StreamMessage, StreamMessageType};

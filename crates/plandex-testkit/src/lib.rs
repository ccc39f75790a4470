//! Test doubles shared across the workspace: an in-memory plan server,
//! scripted model and command runners, and a recording VCS.

pub mod fixtures;
mod model;
mod runner;
mod server;
mod vcs;

pub use model::{ModelCall, ScriptedModelClient};
pub use runner::{ScriptedExec, ScriptedRunner};
pub use server::{FakeServer, ScriptedTurn, TurnEnd, USER_ID};
pub use vcs::FakeVcs;

use plandex_stream::{Frame, Sentinel, StreamMessage, encode_record};

/// Concatenates encoded stream records.
pub fn framed(frames: &[Frame]) -> String {
    frames.iter().map(encode_record).collect()
}

/// A stream that replies `text` and finishes.
pub fn reply_body(text: &str) -> String {
    framed(&[
        Frame::Message(Box::new(StreamMessage::reply(text))),
        Frame::Sentinel(Sentinel::End),
    ])
}

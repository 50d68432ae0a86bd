//! # speech-stream
//!
//! Full-duplex audio streaming between local audio devices and a remote
//! conversational speech service.
//!
//! - [`audio`]: the sample codec, jitter buffer, render scheduler and capture encoder
//! - [`transport`]: the wire protocol and the WebSocket channel
//! - [`session`]: the stream session state machine and its task
//! - [`handlers`], [`health`], [`middleware`], [`state`]: the HTTP control API

pub mod audio;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod session;
pub mod state;
pub mod transport;

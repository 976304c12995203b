//! Core of the deep listening practice bot.
//!
//! Holds the pieces with real state and lifecycle: the per-user practice
//! state machine (`practice`), its session store (`session`), the timer
//! service feeding the shared event pipeline (`timer`), and the token cache
//! backing the recordings library (`library`). The chat transport, backend
//! store, and transcription provider are collaborators behind traits
//! (`transport`, `backend`, `transcribe`); concrete adapters live in the
//! service crate.

pub mod backend;
pub mod event;
pub mod library;
pub mod practice;
pub mod session;
pub mod timer;
pub mod transcribe;
pub mod transport;

pub use event::Event;
pub use practice::{FlowSettings, PracticeFlow, StartRequest};

//! Typing indicators, both directions.
//!
//! The own half debounces start signals and auto-stops after inactivity so
//! a burst of keystrokes costs at most one start and one stop on the wire.
//! The observed half expires remote indicators on a timer twice the
//! send-side auto-stop, so a peer that vanishes mid-word still clears.

pub mod config;
pub mod coordinator;

pub use config::TypingConfig;
pub use coordinator::{TypingCoordinator, TypingEvent, TypingSignalSink};

//! Session integration tests against scripted transport and auth doubles.

mod session_flow;

//! Dashboard-client half of the realtime protocol: push-channel sync and the
//! automated-reply orchestrator.

pub mod orchestrator;
pub mod sync;

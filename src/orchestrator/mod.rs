//! Application-level orchestration.
//!
//! This module owns the session lifecycle: backend resolution, catalog lookup, image
//! preparation, segmentation and backend teardown. The CLI layer consumes the events it emits.

mod controller;

pub(crate) use controller::{run_session, BackendChoice, ScaleChoice, SessionPlan};

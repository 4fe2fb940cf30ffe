// Frame orchestration: swapchain ownership, in-flight sync, per-image
// command recording.

pub mod orchestrator;

pub use orchestrator::{in_flight_slots, CameraUniform, FrameOrchestrator};

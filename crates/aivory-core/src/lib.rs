pub mod capture;
pub mod release;
pub mod wire;

pub use capture::{Breakpoint, CapturedValue, ExceptionCapture, StackFrame, TypeTag};
pub use release::{ReleaseOptions, ReleaseRecord};
pub use wire::{
    BreakpointHitPayload, CollectorMsg, Envelope, ErrorPayload, ExceptionPayload,
    HeartbeatPayload, RegisterPayload, RegisteredPayload, RemoveBreakpointPayload,
    RuntimeIdentity, SetBreakpointPayload, DEFAULT_COLLECTOR_URL,
};

/// Hard cap on the number of frames carried by any capture or harvest.
pub const MAX_STACK_FRAMES: usize = 50;

// Link module — transport seam, serialized operations, lifecycle, quirks

pub mod lifecycle;
pub mod operation;
pub mod quirks;
pub mod transport;

pub use operation::{Escalation, OperationQueueHandle, QueueStats};
pub use quirks::{DeviceMatcher, DeviceQuirks, QuirkRule, QuirkTable};
pub use transport::{
    ConnectionState, DisconnectReason, HandshakeStage, LinkError, LinkEvent, LinkEventReceiver,
    LinkPhase, LinkTarget, ServiceMap, Target, TransportLink,
};

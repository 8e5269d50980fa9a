// Message module — delivery queue, status tracking, notification dispatch

pub mod delivery;
pub mod notify;
pub mod status;

pub use delivery::{
    AckFrame, AckOutcome, Delivery, DeliveryEvent, DeliveryStats, PacketQueueHandle,
};
pub use notify::{NotificationDispatcher, NotificationHandler};
pub use status::{MessageStatus, StatusTracker};

//! tvim Core - Shared types for the TV input session broker
//!
//! This crate provides the domain types shared between the broker
//! daemon (tvimd), the provider runtime (tvim-provider) and the
//! wire protocol (tvim-protocol).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod channel;
pub mod error;
pub mod event;
pub mod hardware;
pub mod ids;
pub mod input;
pub mod media;
pub mod rating;
pub mod track;

// Re-exports for convenience
pub use channel::{ChannelUri, TuneParams};
pub use error::{DomainError, DomainResult};
pub use event::SessionEvent;
pub use hardware::{HardwareInfo, HdmiDeviceInfo, HdmiPowerStatus, StreamConfig};
pub use ids::{CallerIdentity, ClientId, Permission, SessionToken, Uid, UserId};
pub use input::{ComponentName, InputDescriptor, InputId, InputState, InputType};
pub use media::{Bundle, PlaybackParams, Rect, SurfaceHandle, TimeShiftStatus, VideoUnavailableReason};
pub use rating::ContentRating;
pub use track::{TrackInfo, TrackType};

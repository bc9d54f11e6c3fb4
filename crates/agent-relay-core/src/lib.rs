//! Core model for remote agent streaming clients.
//!
//! This crate provides the fundamental building blocks:
//! - `SessionId` - Provisional/durable session identifiers
//! - `Message` - Transcript messages with locally-minted ids
//! - `SessionStore` - Single source of truth for all session state
//! - `LineBuffer` - Chunk-boundary-invariant line splitting + sanitization
//! - `DeltaThrottle` - Bounded-rate render flushing

pub mod id;
pub mod message;
pub mod sanitize;
pub mod session;
pub mod store;
pub mod throttle;

pub use id::SessionId;
pub use message::{CodeReference, IdMinter, Message, Role, dedupe_ids};
pub use sanitize::{LineBuffer, sanitize_line};
pub use session::{PendingQuestion, PermissionDenial, RunStatus, SessionState, ToolActivity};
pub use store::{SessionStore, StoreError, StoreUpdate};
pub use throttle::DeltaThrottle;

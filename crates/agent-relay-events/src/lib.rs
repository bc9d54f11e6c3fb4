//! Event envelope parsing and provider event dispatch.
//!
//! One sanitized line in, one effect on session state out:
//! - `parse_line` - classify a line (lifecycle / provider event / noise / text)
//! - `ProviderEvent` - the typed provider event model
//! - `dispatch` - apply a parsed event through a [`SessionEffects`] context

pub mod dispatch;
pub mod envelope;
pub mod provider;

pub use dispatch::{SessionEffects, dispatch};
pub use envelope::{Envelope, LifecycleEnvelope, parse_line};
pub use provider::{AssistantEvent, DenialEntry, ParsedEvent, ProviderEvent};

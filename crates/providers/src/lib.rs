//! Model transports for ironloop.
//!
//! All transports implement the `ironloop_core::ChatTransport` trait.
//! The router selects the correct one based on configuration.

pub mod openai_compat;
pub mod router;
pub mod scripted;

pub use openai_compat::OpenAiCompatTransport;
pub use router::{ProviderRouter, build_from_config};
pub use scripted::{ScriptedTransport, ScriptedTurn};

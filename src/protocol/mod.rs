//! Protocol object implementations.
//!
//! - [`display`] - `wl_display`, `wl_callback`, `wl_registry`
//! - [`output_management`] - `zwlr_output_manager_v1` and its children

pub mod display;
pub mod output_management;

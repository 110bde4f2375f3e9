pub mod actions;
pub mod commands;
pub mod events;

pub use actions::SerenityActionProvider;

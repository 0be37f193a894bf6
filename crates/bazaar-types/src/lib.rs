pub mod api;
pub mod body;
pub mod events;

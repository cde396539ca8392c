pub mod catalog;
pub mod events;
pub mod plan;
pub mod runs;

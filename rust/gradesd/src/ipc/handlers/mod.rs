pub mod core;
pub mod entry;
pub mod grades;
pub mod roster;

pub mod catalog;
pub mod core;
pub mod gradebook;
pub mod grades;
pub mod submissions;

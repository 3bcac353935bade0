pub mod attendance;
pub mod core;
pub mod mock;
pub mod results;
pub mod subjects;
pub mod teachers;

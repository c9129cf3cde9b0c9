pub mod core;
pub mod exchange;
pub mod records;
pub mod students;
pub mod summary;
pub mod teachers;

pub mod core;
pub mod departments;
pub mod ensembles;
pub mod events;
pub mod exams;
pub mod method;
pub mod reports;
pub mod settings;
pub mod students;
pub mod teachers;

pub mod backup;
pub mod core;
pub mod enrollments;
pub mod evaluations;
pub mod grades;
pub mod reports;
pub mod students;
pub mod subjects;

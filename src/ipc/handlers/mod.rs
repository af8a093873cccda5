pub mod assessments;
pub mod attempts;
pub mod backup;
pub mod classrooms;
pub mod core;
pub mod courses;
pub mod enrollments;
pub mod grading;
pub mod programs;
pub mod users;

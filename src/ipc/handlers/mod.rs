pub mod assessments;
pub mod backup_exchange;
pub mod core;
pub mod evaluations;
pub mod fees;
pub mod placements;
pub mod rubric;
pub mod setup;
pub mod students;
pub mod teachers;

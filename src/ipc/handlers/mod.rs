pub mod backup_exchange;
pub mod candidatures;
pub mod classes;
pub mod core;
pub mod decision;
pub mod documents;
pub mod enrollment;
pub mod evaluation;
pub mod reports;
pub mod setup;
pub mod students;

pub mod history_csv;
pub mod models;
pub mod settings;

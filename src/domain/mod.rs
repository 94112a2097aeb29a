pub mod models;
pub mod series;

pub mod config;
pub mod privileges;

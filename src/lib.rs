pub mod app;
pub mod config;
pub mod pages;
pub mod publish;
pub mod quota;
pub mod settings;
pub mod upload;

pub mod cli;
pub mod conf;
pub mod log;
pub mod web;

pub mod config;
pub mod errors;
pub mod gateway;
pub mod pipeline;
pub mod run;
pub mod storage;
pub mod ui;
pub mod workflow;

#![forbid(unsafe_code)]

pub mod cache;
pub mod cli;
pub mod config;
pub mod download;
pub mod formats;
pub mod http;
pub mod input;
pub mod logging;
pub mod metadata;
pub mod pipeline;
pub mod report;
pub mod route;
pub mod scan;

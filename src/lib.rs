pub mod chunk;
pub mod config;
pub mod coordinator;
pub mod error;
mod fs_utils;
pub mod metadata;
pub mod urls;
mod worker;
mod writer;

pub use coordinator::{Downloader, DownloaderBuilder};

pub mod config;
pub mod fields;
pub mod pipeline;
pub mod policy;
pub mod progress;
pub mod sentinels;
pub mod terminology;
pub mod tree;
pub mod writer;

pub mod address;
pub mod app;
pub mod archive;
pub mod cache_index;
pub mod config;
pub mod dicom;
pub mod error;
pub mod fs_util;
pub mod host;
pub mod ledger;
pub mod load;
pub mod output;
pub mod package;
pub mod store;
pub mod xnat;

//! Preview LabVIEW VI files as HTML through a serialized, file-locked vendor CLI.

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
pub mod presentation;

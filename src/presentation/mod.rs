//! HTML surfaces returned to the preview host.

pub mod views;

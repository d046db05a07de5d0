//! Foundation module - math types and logging set-up shared by the crate

pub mod logging;
pub mod math;

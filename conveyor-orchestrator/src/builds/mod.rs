//! Build lifecycle helpers outside the scheduler.

pub mod tracker;

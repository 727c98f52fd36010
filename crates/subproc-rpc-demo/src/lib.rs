//! Demo services for the `spr-demo-caller` / `spr-demo-runner` pair.

pub mod comm;
pub mod parent;
pub mod worker;

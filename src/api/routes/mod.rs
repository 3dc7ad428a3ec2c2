//! Route handlers, one module per resource

pub mod alerts;
pub mod health;
pub mod poll;
pub mod tasks;

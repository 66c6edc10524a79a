//! Component health, atomic status transitions, and emergency controls.

pub mod state;

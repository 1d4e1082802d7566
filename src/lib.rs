pub mod config;
pub mod control;
pub mod display;
pub mod error;
pub mod messages;
pub mod motor;
pub mod runtime;
pub mod state;
pub mod vesc;
pub mod watchdog;

pub mod api;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod negotiator;
pub mod notification;
pub mod radio;
pub mod radio_state;
pub mod registry;
pub mod services;

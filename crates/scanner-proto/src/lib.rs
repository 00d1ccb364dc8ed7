pub mod calls;
pub mod config;
pub mod platform;
pub mod protocol;
pub mod shuffle;
pub mod state;
pub mod visual;

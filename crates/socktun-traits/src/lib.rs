pub mod cancel;
pub mod config;
pub mod logging;
pub mod provision;
pub mod proxy;
pub mod trust;
pub mod tunnel;

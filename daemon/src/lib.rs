pub const APP_NAME: &str = "amux-tracker-daemon";

pub mod bus;
pub mod collector;
pub mod command;
pub mod config;
pub mod detector;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod parsers;
pub mod service;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_non_empty() {
        assert!(!version().is_empty());
    }
}

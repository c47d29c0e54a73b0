mod build_info;
pub mod logging;
pub mod version;

pub use logging::LoggingError;

pub mod app;
pub mod replay;
pub mod telemetry;

pub use app::run as run_app;

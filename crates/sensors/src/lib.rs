pub mod board;
pub mod cyton;
pub mod synthetic;
pub mod types;

// Re-export the main types that users need
pub use board::BoardKind;
pub use types::{create_session, AcquisitionSession, DeviceError, SessionConfig, SessionStatus};
pub use cyton::driver::CytonSession;
pub use synthetic::driver::SyntheticSession;

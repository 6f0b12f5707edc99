pub mod session_context;
pub mod session_machine;

pub use session_context::{SessionContext, SessionOutcome};
pub use session_machine::SessionMachine;

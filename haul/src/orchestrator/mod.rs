//! Migration orchestration: the phase machine, session identity and the
//! source-side protocol driver.

pub mod migration;
pub mod session;
pub mod state_machine;

pub use migration::{LiveProtocol, Orchestrator};
pub use session::MigrationSession;
pub use state_machine::{IllegalTransition, MigrationPhase, PhaseMachine, TransitionRecord};

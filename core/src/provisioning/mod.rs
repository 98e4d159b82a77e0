//! Provisioning session: states, log, configuration progress and the protocol flow

pub mod machine;
pub mod session;
pub mod state;

pub use machine::{Action, ProtocolError, ProvisioningFlow, StepOutcome};
pub use session::{ConfigProgress, ConfigStep, Session, StepError};
pub use state::{Direction, LogEntry, ProvisioningState, StateError, StateLog};

pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod hyperv;
pub mod timeout;
pub mod validator;

pub use dispatcher::{FailureKind, OperationOutcome, OperationRequest, PowerRequest, VmDispatcher};
pub use error::RequestError;
pub use executor::{CommandExecutor, CommandResult, CommandRunner};
pub use hyperv::{VmAction, VmOperation};
pub use timeout::{TimeoutPhase, TimeoutStrategy, TimeoutTracker};
pub use validator::VmNameValidator;

//! Step outcomes and dispatch
//!
//! A step is one unit of update work. Its result is always one of four
//! outcomes, which the process boundary turns into an exit code and a one
//! line JSON message on stderr:
//!
//! | Outcome          | Exit code |
//! |------------------|-----------|
//! | `Success`        | 0         |
//! | `SafeToReboot`   | 42        |
//! | `UnsafeToReboot` | 52        |
//! | `UnknownError`   | 1         |

use crate::error::Error;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Exit code for failures that leave the device safe to reboot
pub const EXIT_SAFE_TO_REBOOT: i32 = 42;
/// Exit code for failures that leave the device unsafe to reboot
pub const EXIT_UNSAFE_TO_REBOOT: i32 = 52;
/// Exit code for failures that could not be classified
pub const EXIT_UNKNOWN: i32 = 1;

/// Result of running one step
#[derive(Debug)]
pub enum StepOutcome {
    Success,
    /// Device and image are unaffected; rebooting and retrying is fine
    SafeToReboot(Error),
    /// A write may have happened and was not confirmed
    UnsafeToReboot(Error),
    /// Could not be classified; callers must treat it as unsafe
    UnknownError(Error),
}

#[derive(Serialize)]
struct JsonMessage<'a> {
    message: &'a str,
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Whether a conservative caller may reboot the device now
    pub fn is_safe_to_reboot(&self) -> bool {
        matches!(self, Self::Success | Self::SafeToReboot(_))
    }

    /// The underlying error, if the step failed
    pub fn cause(&self) -> Option<&Error> {
        match self {
            Self::Success => None,
            Self::SafeToReboot(e) | Self::UnsafeToReboot(e) | Self::UnknownError(e) => Some(e),
        }
    }

    /// Process exit code for this outcome
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Success => 0,
            Self::SafeToReboot(_) => EXIT_SAFE_TO_REBOOT,
            Self::UnsafeToReboot(_) => EXIT_UNSAFE_TO_REBOOT,
            Self::UnknownError(_) => EXIT_UNKNOWN,
        }
    }

    /// Single line `{"message": ...}` for stderr, `None` on success
    pub fn to_json(&self) -> Option<String> {
        let chain = self.cause()?.chain();
        // A struct with one string field always serializes
        serde_json::to_string(&JsonMessage { message: &chain }).ok()
    }

    /// Lifecycle state this outcome leaves the step in
    pub fn state(&self) -> StepState {
        match self {
            Self::Success => StepState::Success,
            Self::SafeToReboot(_) => StepState::SafeToReboot,
            Self::UnsafeToReboot(_) => StepState::UnsafeToReboot,
            Self::UnknownError(_) => StepState::UnknownError,
        }
    }
}

impl From<Error> for StepOutcome {
    /// Unclassified errors are unknown
    fn from(err: Error) -> Self {
        Self::UnknownError(err)
    }
}

/// Lifecycle of a step within one invocation
///
/// A step runs at most once, so every state but `NotRun` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    NotRun,
    Success,
    SafeToReboot,
    UnsafeToReboot,
    UnknownError,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        self != Self::NotRun
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotRun => "not run",
            Self::Success => "success",
            Self::SafeToReboot => "safe to reboot",
            Self::UnsafeToReboot => "unsafe to reboot",
            Self::UnknownError => "unknown error",
        };
        f.write_str(s)
    }
}

/// Arguments handed to every step
#[derive(Debug, Clone, Default)]
pub struct StepArgs {
    /// `type:specifier` of the target device
    pub device_id: String,
    /// Image file to flash or check
    pub image_path: PathBuf,
}

/// One unit of update work
pub trait Step {
    /// Name the step is dispatched under
    fn name(&self) -> &'static str;

    /// Run the step once and classify its result
    fn run(&self, args: &StepArgs) -> StepOutcome;
}

/// Steps available to the dispatcher, keyed by name
#[derive(Default)]
pub struct StepRegistry {
    steps: BTreeMap<&'static str, Box<dyn Step>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step, replacing any step of the same name
    pub fn register(&mut self, step: Box<dyn Step>) {
        self.steps.insert(step.name(), step);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Step> {
        self.steps.get(name).map(|s| s.as_ref())
    }

    /// Registered step names, sorted
    pub fn names(&self) -> Vec<&'static str> {
        self.steps.keys().copied().collect()
    }

    /// Run the step `name`
    ///
    /// An unregistered name is an unknown error.
    pub fn run(&self, name: &str, args: &StepArgs) -> StepOutcome {
        match self.get(name) {
            Some(step) => step.run(args),
            None => StepOutcome::UnknownError(Error::Command {
                command: name.to_string(),
                reason: "no such step".to_string(),
            }),
        }
    }
}

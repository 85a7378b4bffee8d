use fleetgrid_executor::ExecutorError;
use thiserror::Error;

pub type SampleResult<T> = Result<T, SampleError>;

/// Why a sample could not be taken. Never a reason to kill.
#[derive(Debug, Error)]
pub enum SampleError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("process {pid} is gone")]
    ProcessGone { pid: u32 },

    #[error("no {0} data available")]
    NoData(&'static str),

    #[error("cannot parse sampler output: {0}")]
    Parse(String),

    #[error("sampler does not apply to this target")]
    WrongTarget,
}

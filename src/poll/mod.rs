//! Convergence polling against an eventually-consistent read side.

mod poller;
mod ports;

pub use poller::{ConvergencePoller, PollError, PollOutcome, PollReport, PollRequest, RequestError};
pub use ports::{CommitSnapshot, ReadError, RefreshError, RemoteRead, RemoteRefresh};

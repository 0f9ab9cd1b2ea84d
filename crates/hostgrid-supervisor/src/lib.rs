//! hostgrid-supervisor — client for the external process supervisor.
//!
//! The agent never starts OS processes itself. It writes watch definitions,
//! asks the supervisor to reload and start or stop them, and reads back the
//! supervisor's view of every watch.

pub mod error;
pub mod monit;
pub mod traits;

pub use error::{SupervisorError, SupervisorResult};
pub use monit::MonitSupervisor;
pub use traits::{ProcessSupervisor, WatchOptions, WatchSpec, WatchState};

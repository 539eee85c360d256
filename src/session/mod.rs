//! Session Module
//!
//! The orchestrator between the native binding, history storage and the
//! upload gateway. A single [`SessionController`] task owns all session
//! state; consumers hold a cloneable [`SessionHandle`] and read state from a
//! watch channel of [`SessionSnapshot`](crate::domain::models::SessionSnapshot).
//!
//! ```text
//!  SessionHandle ──commands──┐
//!  DeviceEvent stream ───────┤
//!  Scheduler (timers) ───────┼──► SessionController ──► watch<SessionSnapshot>
//!  background results ───────┘          │
//!                                       ├──► BindingClient
//!                                       ├──► HistoryStore
//!                                       └──► CsvUploader
//! ```

pub mod controller;
pub mod queue;
pub mod scheduler;


pub use controller::{SessionController, SessionError, SessionHandle};

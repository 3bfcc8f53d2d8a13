//! Booking automation
//!
//! Client records, the booking state machine and the workflow that drives a
//! booking through a portal once slots are found.

mod fields;
mod types;
mod workflow;

pub use fields::{fill_client_fields, FieldKind};
pub use types::{
    BookingAction, BookingError, BookingObserver, BookingRequest, BookingResult, BookingStatus,
    ClientRecord, LogObserver, ProcedureCategory,
};
pub use workflow::BookingWorkflow;

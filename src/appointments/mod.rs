pub mod api;
pub mod models;
pub mod store;
pub mod sweeper;
pub mod workflow;

pub use models::{Appointment, CaptureMetadata, NewAppointment, ReservationState};
pub use store::AppointmentStore;
pub use workflow::{capture_payment, provision_meeting_link, CaptureRequest};

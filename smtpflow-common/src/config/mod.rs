//! Configuration types shared by the smtpflow front doors.

pub mod timeouts;

pub use timeouts::ServerTimeouts;

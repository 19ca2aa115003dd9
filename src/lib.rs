//! A user-space IPv4 networking stack over SLIP-framed serial lines.
//!
//! Three layers compose bottom-up: [`link`] frames datagrams onto serial
//! lines with SLIP byte stuffing, [`ip`] routes and forwards IPv4 datagrams
//! (acting as host or router), and [`tcp`] terminates server-side TCP
//! connections with in-order delivery and stop-and-wait reliable sending.
//!
//! Everything runs on a single-threaded cooperative model: serial receive
//! callbacks, timer callbacks and application calls all run to completion on
//! one task queue. Timers come from a [`sched::Scheduler`] the host provides.

mod err;
pub use err::*;

pub mod ip;
pub mod link;
pub mod phys;
pub mod sched;
pub mod tcp;

//! DNS plumbing shared by the simulated servers and the censorship filter.

pub mod database;
pub mod handler;
pub mod wire;

pub use database::{DnsDatabase, Lookup};
pub use handler::{DatabaseHandler, DnsHandler};
pub use wire::{Message, Question, Record, RecordData, ResponseCode, WireError};

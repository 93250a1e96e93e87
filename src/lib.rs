//! Booking record dispatcher over SQLite, plus a Gmail sending utility.
//!
//! # Intention
//!
//! - Serve one CRUD command per process: a verb on the command line, a JSON
//!   envelope on stdin, one JSON document on stdout.
//! - Keep the record store behind typed CRUD operations with a reflected
//!   field whitelist.
//! - Send single plain-text mails with a cached OAuth credential.
//!
//! # Architectural Boundaries
//!
//! - Only the single `booking` table is handled; no schema management.
//! - Authentication of callers is the caller's concern.

pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod mail;
pub mod sqlite;

pub use dispatch::{dispatch, handle, Response, Verb};
pub use envelope::Envelope;
pub use error::{BookingError, Result};
pub use sqlite::{SqliteStore, StoreConfig};

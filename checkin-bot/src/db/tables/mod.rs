//! Database model modules - extends Database with domain-specific methods
//!
//! Each module adds `impl Database` blocks with methods for a specific table group.

mod checkin_records; // checkin_records
mod site_sessions;   // site_sessions

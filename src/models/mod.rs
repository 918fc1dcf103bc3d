//! Core data models for the resumable upload service.
//!
//! `Upload` is the domain view handed to handlers and the state machine;
//! `UploadRow` maps the SQLite `uploads` table via `sqlx::FromRow`.

pub mod upload;

//! End-to-end workflow tests

mod admin;
mod apply_session;
mod restore_points;

//! Utilities for testing code that deals with VTXOs.
//!
//! The module is only available if the `test-util` feature is used.

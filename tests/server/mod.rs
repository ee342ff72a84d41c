//! HTTP payload tests.

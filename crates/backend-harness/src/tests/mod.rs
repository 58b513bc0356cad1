//! Test suites for the backend harness.

pub(crate) mod support;

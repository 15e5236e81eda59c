//! wirecall-interop: the interop protocol suite.
//!
//! The message set, the reference test service, and the named test cases
//! used to validate a wirecall implementation end to end. The
//! `interop-client` and `interop-server` binaries wrap these for use
//! against out-of-process peers.

pub mod cases;
pub mod messages;
pub mod service;

pub use cases::{run_test_case, test_service_descriptor, InteropTarget, TEST_CASES};
pub use service::{test_service, ECHO_INITIAL_KEY, ECHO_TRAILING_KEY, SERVICE_NAME};

pub mod fake;
pub mod harness;

pub use fake::{FakeVmms, RunScript};
pub use harness::{ServerHarness, TestStack};

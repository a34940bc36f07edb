// Frame producers
//
// Real capture sources live outside the engine and only need a `SessionHandle`.
// The synthetic source stands in for one in the demo binary and the soak test.

pub mod synthetic;

pub use synthetic::*;

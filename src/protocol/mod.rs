//! Wire codecs for the supported instrument families.
//!
//! Codecs are pure: they build and parse frames. I/O lives in the drivers
//! (`crate::devices`) and the simulators (`crate::sim`), which share these
//! codecs so both sides of every exchange use the same encoding.

pub mod apt;
pub mod elliptec;
pub mod scpi;

pub mod parse;
#[cfg(feature = "mqtt")]
pub mod publish;
pub mod runs;
pub mod serve;

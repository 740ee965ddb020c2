// sandpit-common: shared types and wire protocol for the Sandpit workspace

pub mod protocol;
pub mod types;

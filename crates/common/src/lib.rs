// cinder-common: shared types and protocol definitions for the Cinder workspace

pub mod protocol;
pub mod types;

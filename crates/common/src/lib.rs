// agora-common: shared types and protocol definitions for the Agora workspace

pub mod protocol;
pub mod types;

// berth-common: wire types shared by the berth daemon and CLI

pub mod protocol;
pub mod types;

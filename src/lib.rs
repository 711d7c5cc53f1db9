pub mod blowfish;
pub mod commands;
pub mod context;
pub mod device;
pub mod env;
pub mod flags;
pub mod kobs;
pub mod nand;
pub mod partitions;
pub mod sfu;
pub mod status;
pub mod util;

#![doc = include_str!("../../doc_include.md")]

pub mod arm_config;
pub mod arm_driver;
pub mod command;
pub mod feetech;
pub mod follower;
pub mod helper_process;
pub mod jump_protection;
pub mod leader;
pub mod shutdown;
pub mod transport;

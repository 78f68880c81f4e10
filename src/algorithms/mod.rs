pub mod consensus;
pub mod rl;

pub mod deploy;
pub mod hook;
pub mod integrate;
pub mod maintenance;
pub mod restart;

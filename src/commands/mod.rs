pub mod config;
pub mod directory;
pub mod object;
pub mod sync;

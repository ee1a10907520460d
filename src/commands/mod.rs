pub mod batch;
pub mod context;
pub mod extract;
pub mod health;
pub mod process;
pub mod status;
pub mod sweep;

pub mod config;
pub mod fq;
pub mod sched;
pub mod tcp;

pub mod atomic_write;
pub mod crypto;
pub mod data_dir;
pub mod logging;
pub mod sos;

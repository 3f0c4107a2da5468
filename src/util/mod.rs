pub mod arch;
pub mod fixed_buf;

pub use arch::program_counter;
pub use fixed_buf::FixedBuf;

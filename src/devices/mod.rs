//! Memory-mapped peripherals
//!
//! Each device implements `Bus` over offsets from its mapping base and
//! buffers any host-visible output for the system to drain between steps.

mod mtimer;
mod tbio;
mod uart;

pub use mtimer::MTimer;
pub use tbio::TbIo;
pub use uart::Uart;

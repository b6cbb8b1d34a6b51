mod device;
mod remote;

pub use device::*;
pub use remote::*;

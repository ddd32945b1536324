mod arena;
mod bitmap;
mod frame_wtr;
mod rtt;
mod timer;

pub use arena::*;
pub use bitmap::*;
pub use frame_wtr::*;
pub use rtt::*;
pub use timer::*;

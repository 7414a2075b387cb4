mod messages;
mod test_rig;

pub use messages::*;
pub use test_rig::*;

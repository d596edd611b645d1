pub mod pump;
pub mod registry;
pub mod session;

pub use pump::StopFlag;
pub use registry::{Admission, SessionRegistry};

pub mod credential;
pub mod egress;

pub use credential::*;
pub use egress::*;

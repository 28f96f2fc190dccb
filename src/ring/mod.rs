mod backing;
mod capacity;

pub(crate) use backing::*;
pub(crate) use capacity::*;

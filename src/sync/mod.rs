mod slot;

pub(crate) use slot::*;

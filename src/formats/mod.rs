//! Binary file format support

pub mod gr2;

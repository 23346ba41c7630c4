//! OpenBCI Cyton (and Cyton+Daisy) serial protocol support.

pub mod driver;
pub mod link;
pub mod packet;

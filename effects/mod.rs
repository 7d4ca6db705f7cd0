#![deny(dead_code)]
#![deny(unused_imports)]

pub mod aggregate;
pub mod construction;
pub mod errors;
pub mod grid;

pub mod estimand;
pub mod hypothesis;
pub mod inference;
pub mod jacobian;
pub mod margins;
pub mod mixed;
pub mod model;
pub mod options;
pub mod posterior;
pub mod table;

//! Wire types and naming rules shared by every messaging component

pub mod envelope;
pub mod naming;

pub use envelope::*;
pub use naming::*;

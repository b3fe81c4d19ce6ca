//! Wire types shared between the council sync client and its command-line apps.

pub mod domain;
pub mod error;
pub mod protocol;

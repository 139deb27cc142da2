//! Client-side configuration: the connection document written by
//! `repository connect` and the password sources it references.

mod client_config;
pub use client_config::*;

mod password;
pub use password::*;

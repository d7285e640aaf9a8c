pub mod origin;
pub mod session;

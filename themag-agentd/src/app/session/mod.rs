pub mod connection;
pub mod service;

pub use connection::serve_socket;
pub use service::SessionContext;

pub mod live;
mod server;

pub use server::{router, serve, ApiError, ServeError};

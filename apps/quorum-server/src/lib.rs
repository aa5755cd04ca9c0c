#![forbid(unsafe_code)]

mod server;

pub use server::{build_router, init_tracing, verify_store, AppConfig};

pub mod decoder;
pub mod handler;

pub use handler::IngestHandler;

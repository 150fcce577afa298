mod encoder;
pub use encoder::{Albert, AlbertUnshared};

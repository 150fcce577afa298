mod encoder;
pub use encoder::Nezha;

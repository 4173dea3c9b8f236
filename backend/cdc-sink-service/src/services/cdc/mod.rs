pub mod codec;
mod decoder;
mod models;

pub use decoder::decode;
pub use models::{ChangeEvent, ChangeOp, FieldValue, Row};

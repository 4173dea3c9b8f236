pub mod apply;
pub mod cdc;
pub mod pipeline;

mod admin;
mod source;

pub use admin::KafkaTopicAdmin;
pub use source::KafkaSource;

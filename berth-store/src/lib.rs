pub mod app_config;
pub mod database;
pub mod events;
pub mod memory;
pub mod pg;
pub mod redis_repo;

pub use app_config::Config;
pub use database::DbClient;
pub use events::{EventProducer, KafkaEventSink};
pub use memory::InMemoryStore;
pub use pg::PgStore;
pub use redis_repo::RedisClient;

// Frame pipeline: buffer, timeline, worker pool, scheduler and player

pub mod buffer;
pub mod events;
pub mod integrity;
pub mod manifest;
pub mod moving_average;
pub mod player;
pub mod progress;
pub mod scheduler;
pub mod timeline;
pub mod worker_pool;

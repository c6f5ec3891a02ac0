pub mod delivery;
pub mod engine;
pub mod hub;
pub mod jobs;
pub mod limits;
pub mod model;
pub mod observability;
pub mod seed;
pub mod wal;

pub mod analysis;
pub mod answer_log;
pub mod authorization;
pub mod coordinator;
pub mod encode;
pub mod error;
pub mod mirror;
pub mod overlay;
pub mod paths;
pub mod permission_watch;
pub mod permissions;
pub mod review;
pub mod service;
pub mod session;
pub mod settings;

pub mod downloader;
pub mod health_checker;
pub mod keepalive;
pub mod launcher;
pub mod process_checker;
pub mod proxy;
pub mod restart_scheduler;
pub mod status_store;
pub mod subscription;
pub mod supervisor;
pub mod tunnel_domain;

pub use launcher::Launcher;
pub use supervisor::Supervisor;

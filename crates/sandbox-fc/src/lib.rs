mod api;
mod command;
mod config;
mod factory;
mod machine;
mod network;
mod overlay;
mod paths;
mod prerequisites;
mod process;

pub use api::{ApiError, FirecrackerApi};
pub use config::FirecrackerConfig;
pub use factory::FirecrackerFactory;
pub use machine::FirecrackerVm;
pub use network::{NetworkAlloc, NetworkAllocator, NetworkError, kernel_boot_args};
pub use paths::{FactoryPaths, VmPaths};

//! Git mirror cache

mod archive;
mod bootstrap;
mod git;
mod lock;
mod maintenance;
mod mirror;
mod paths;
mod retry;
mod store;

pub use git::{GitCli, Vcs};
pub use maintenance::unlock_all;
pub use mirror::{MirrorCache, PopulateOptions, SnapshotOptions};
pub use paths::{CachePaths, MirrorIdentity, dir_to_url};
pub use retry::RetryPolicy;
pub use store::StoreLocation;

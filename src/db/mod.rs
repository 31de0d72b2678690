mod artifacts;
mod build;
mod http;
mod lazy;
mod package_db;
mod slice;
mod store;

pub use artifacts::{Sdist, Wheel, WheelVitals};
pub use build::{pick_best_wheel, SdistBuilder};
pub use http::{CacheMode, CacheStatus, Credentials, Http, HttpOptions, NotCached};
pub use lazy::LazyRemoteFile;
pub use package_db::{IndexedArtifact, PackageDB};
pub use store::{BlobStore, StoreKey, TreeStore};

mod environment;
mod executor;
mod plan;
mod uninstall;
mod wheel;

pub use environment::{Environment, InstalledDistribution, Snapshot};
pub use executor::{
    default_worker_count, execute, CancelToken, ExecutionReport, ExecutorOptions,
};
pub use plan::{plan, BinaryPolicy, Operation, OperationKind, Plan, PlanOptions};
pub use uninstall::{backup, uninstall, Backup};
pub use wheel::{install_develop, install_wheel, parse_entry_points, Entrypoint};

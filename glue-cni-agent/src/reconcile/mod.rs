pub mod command;
pub mod device;
pub mod nat;
pub mod tc;

use std::fmt::{self, Display};
use std::path::{Path, PathBuf};

use glue_cni_common::{NetworkTopology, partition};
use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::cni;
use crate::topology::{Fence, VersionedTopology};
use crate::{Error, Result};

pub use device::LinkOps;
pub use nat::RuleOps;
pub use tc::FilterOps;

/// Applies host changes: links over netlink, rules and filters through
/// `iptables` and `tc`. The netlink calls block on the runtime, so the
/// operations must be invoked from a blocking thread.
#[derive(Clone)]
pub struct HostKernel {
    netlink: rtnetlink::Handle,
    runtime: Handle,
}

impl HostKernel {
    /// Opens a netlink connection driven by the current runtime.
    pub fn new() -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| Error::Task(e.to_string()))?;
        let (connection, netlink, _) = rtnetlink::new_connection()?;
        runtime.spawn(connection);
        Ok(Self { netlink, runtime })
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Validate,
    Device,
    Nat,
    Filter,
    TopologyFile,
    BootFiles,
}

impl Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Step::Validate => "validate",
            Step::Device => "device",
            Step::Nat => "nat",
            Step::Filter => "filter",
            Step::TopologyFile => "topology_file",
            Step::BootFiles => "boot_files",
        })
    }
}

#[derive(Debug)]
pub enum PassOutcome {
    Applied,
    Failed { step: Step, error: Error },
    /// A newer generation was published before the pass finished.
    Superseded { generation: u64, latest: u64 },
}

impl PassOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            PassOutcome::Applied => "applied",
            PassOutcome::Failed { .. } => "failed",
            PassOutcome::Superseded { .. } => "superseded",
        }
    }
}

/// Every teardown step runs; failures are collected rather than stopping it.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub completed: Vec<Step>,
    pub failures: Vec<(Step, Error)>,
}

impl TeardownReport {
    fn record(&mut self, step: Step, result: Result<()>) {
        match result {
            Ok(()) => self.completed.push(step),
            Err(e) => self.failures.push((step, e)),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn log(&self) {
        if self.is_clean() {
            info!(report = %self, "teardown complete");
        } else {
            warn!(report = %self, "teardown finished with failures");
        }
    }
}

impl Display for TeardownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let completed: Vec<String> = self.completed.iter().map(Step::to_string).collect();
        write!(f, "completed=[{}]", completed.join(","))?;
        for (step, e) in &self.failures {
            write!(f, " {step}=\"{e}\"")?;
        }
        Ok(())
    }
}

pub struct Reconciler<K> {
    kernel: K,
    topology_file: PathBuf,
    boot_files: Vec<PathBuf>,
    fence: Fence,
}

impl<K> Reconciler<K>
where
    K: LinkOps + RuleOps + FilterOps,
{
    pub fn new(kernel: K, topology_file: PathBuf, boot_files: Vec<PathBuf>, fence: Fence) -> Self {
        Self {
            kernel,
            topology_file,
            boot_files,
            fence,
        }
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn topology_file(&self) -> &Path {
        &self.topology_file
    }

    /// Runs one pass for `versioned`. The generation is checked before every
    /// step and the pass stops as soon as a newer one has been published. The
    /// topology file is only written once the host matches the topology.
    pub fn reconcile(&self, versioned: &VersionedTopology) -> PassOutcome {
        let VersionedTopology {
            generation,
            topology,
        } = versioned;
        let generation = *generation;

        let plan = match partition(topology) {
            Ok(plan) => plan,
            Err(e) => {
                return PassOutcome::Failed {
                    step: Step::Validate,
                    error: e.into(),
                };
            }
        };

        let steps: [(Step, &dyn Fn() -> Result<()>); 4] = [
            (Step::Device, &|| device::converge(&self.kernel, topology, &plan)),
            (Step::Nat, &|| nat::converge(&self.kernel, topology)),
            (Step::Filter, &|| tc::converge(&self.kernel, topology)),
            (Step::TopologyFile, &|| {
                topology.store(&self.topology_file).map_err(Error::from)
            }),
        ];
        for (step, apply) in steps {
            if !self.fence.is_current(generation) {
                return PassOutcome::Superseded {
                    generation,
                    latest: self.fence.latest(),
                };
            }
            if let Err(error) = apply() {
                return PassOutcome::Failed { step, error };
            }
        }
        PassOutcome::Applied
    }

    /// Removes everything the agent installed. The filter is only looked up
    /// when an ipvlan topology was attempted, since its match comes from the
    /// service network.
    pub fn teardown(&self, attempted: Option<&NetworkTopology>) -> TeardownReport {
        let mut report = TeardownReport::default();
        report.record(Step::Device, device::teardown(&self.kernel));
        report.record(Step::Nat, nat::teardown(&self.kernel));
        if let Some(topology) = attempted {
            report.record(Step::Filter, tc::teardown(&self.kernel, topology));
        }
        report.record(
            Step::TopologyFile,
            NetworkTopology::remove(&self.topology_file).map_err(Error::from),
        );
        report.record(Step::BootFiles, cni::remove_copied(&self.boot_files));
        report
    }
}

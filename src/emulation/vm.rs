//! The symbolic virtual machine.
//!
//! A [`VirtualMachine`] bundles what every execution graph of one analysis run shares:
//! the class registry, the configuration, the clone strategy derived from both and the
//! op factory. It builds the initial [`ExecutionGraph`] of a method by breadth-first
//! symbolic execution from the method entry and hands out root contexts when the graph
//! is later rewired.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use dexscope::prelude::*;
//!
//! let implementation = parse_smali(
//!     "
//!     .registers 1
//!     const/4 v0, 0x1
//!     return v0
//!     ",
//! )?;
//! let method = Arc::new(LocalMethod::new("Lcom/example/Foo;->one()I", 1, true)?);
//! let vm = VirtualMachine::new(Arc::new(ClassManager::new()), VmConfig::default());
//! let graph = vm.execute(&method, &implementation)?;
//! assert_eq!(graph.children(0)?, vec![1]);
//! # Ok::<(), dexscope::Error>(())
//! ```

use std::{
    collections::VecDeque,
    sync::{atomic::AtomicU64, Arc},
};

use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::{
    emulation::{
        classes::ClassManager,
        cloner::CloneStrategy,
        ops::{DefaultOpFactory, OpFactory},
        ExecutionContext, VmConfig,
    },
    graph::{ExecutionGraph, NodeId},
    method::{LocalMethod, LocationId, MethodImplementation},
    Error, Result,
};

/// Shared state of all execution graphs of one analysis run.
#[derive(Debug)]
pub struct VirtualMachine {
    class_manager: Arc<ClassManager>,
    config: Arc<VmConfig>,
    strategy: Arc<CloneStrategy>,
    factory: Arc<dyn OpFactory>,
    heap_ids: Arc<AtomicU64>,
}

impl VirtualMachine {
    /// Creates a virtual machine over `class_manager` using the [`DefaultOpFactory`].
    #[must_use]
    pub fn new(class_manager: Arc<ClassManager>, config: VmConfig) -> Self {
        let config = Arc::new(config);
        let strategy = CloneStrategy::for_registry(&class_manager, &config);
        let factory = Arc::new(DefaultOpFactory::new(
            Arc::clone(&class_manager),
            Arc::clone(&config),
        ));
        VirtualMachine {
            class_manager,
            config,
            strategy,
            factory,
            heap_ids: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Replaces the op factory.
    #[must_use]
    pub fn with_op_factory(mut self, factory: Arc<dyn OpFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Returns the class registry.
    #[must_use]
    pub fn class_manager(&self) -> &Arc<ClassManager> {
        &self.class_manager
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Returns the heap snapshot strategy shared by all contexts of this machine.
    #[must_use]
    pub fn clone_strategy(&self) -> &Arc<CloneStrategy> {
        &self.strategy
    }

    /// Returns the op factory.
    #[must_use]
    pub fn op_factory(&self) -> &Arc<dyn OpFactory> {
        &self.factory
    }

    /// Creates the state at the entry of `method`, with unknown parameter values.
    ///
    /// Objects allocated under different roots of this machine never share a reference.
    #[must_use]
    pub fn spawn_root_context(&self, method: &Arc<LocalMethod>) -> ExecutionContext {
        ExecutionContext::root(
            Arc::clone(method),
            Arc::clone(&self.strategy),
            Arc::clone(&self.heap_ids),
        )
    }

    /// Symbolically executes `implementation` and returns its execution graph.
    ///
    /// Every location gets a pile with a template op. Execution starts with a root
    /// context at the first instruction and follows every successor an op reports,
    /// giving each reached location one node per path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Empty`] for a method without instructions,
    /// [`Error::OpCreation`] if an op cannot be built, and
    /// [`Error::AddressVisitLimit`] / [`Error::MethodVisitLimit`] when execution does not
    /// terminate within the configured limits.
    pub fn execute(
        &self,
        method: &Arc<LocalMethod>,
        implementation: &MethodImplementation,
    ) -> Result<ExecutionGraph> {
        if method.register_count() != implementation.register_count() {
            return Err(Error::Error(format!(
                "{} declares {} registers, its implementation uses {}",
                method,
                method.register_count(),
                implementation.register_count()
            )));
        }
        let entry = implementation.location_at_index(0).ok_or(Error::Empty)?;

        let mut graph = ExecutionGraph::new(Arc::clone(method));
        for location in implementation.locations() {
            let op = self.factory.create(*location, implementation)?;
            graph.add_pile(*location, op)?;
        }
        graph.set_addresses(implementation);

        let root = self.spawn_node(&mut graph, entry, self.spawn_root_context(method))?;
        let mut queue = VecDeque::from([root]);
        let mut address_visits: FxHashMap<LocationId, usize> = FxHashMap::default();
        let mut method_visits = 0usize;

        while let Some(id) = queue.pop_front() {
            method_visits += 1;
            if method_visits > self.config.max_method_visits {
                return Err(Error::MethodVisitLimit(self.config.max_method_visits));
            }

            let location = graph.node(id)?.location();
            let visits = address_visits.entry(location).or_default();
            *visits += 1;
            if *visits > self.config.max_address_visits {
                return Err(Error::AddressVisitLimit {
                    address: graph.address_of(location).unwrap_or_default(),
                    limit: self.config.max_address_visits,
                });
            }

            for next in graph.execute_node(id)? {
                let context = graph.context(id)?.spawn_child();
                let child = self.spawn_node(&mut graph, next, context)?;
                graph.attach(id, child)?;
                queue.push_back(child);
            }
        }

        log::debug!(
            "{}: executed {} nodes over {} locations",
            method,
            method_visits,
            implementation.len()
        );
        Ok(graph)
    }

    fn spawn_node(
        &self,
        graph: &mut ExecutionGraph,
        location: LocationId,
        context: ExecutionContext,
    ) -> Result<NodeId> {
        let op = graph.template_op(location).ok_or(Error::GraphInconsistency {
            location,
            reason: "successor has no node pile".to_string(),
        })?;
        graph.add_node(location, op, context)
    }

    /// Executes many methods in parallel.
    ///
    /// Each method gets an independent graph; results are returned in input order.
    #[must_use]
    pub fn execute_all(
        &self,
        methods: &[(Arc<LocalMethod>, MethodImplementation)],
    ) -> Vec<Result<ExecutionGraph>> {
        methods
            .par_iter()
            .map(|(method, implementation)| self.execute(method, implementation))
            .collect()
    }
}

//! Patchflow is a dependency-driven task scheduler for simulations on
//! structured grids decomposed into rectangular patches. Physics tasks
//! declare the variables they read (with ghost-layer widths), create and
//! update on each patch; from those declarations alone the library derives
//! a deterministic execution order and the data exchanged between
//! processes. Variables live in a two-generation data warehouse: "old" holds
//! the results of the previous step, and "new" accumulates the step in
//! progress until it is promoted.

pub mod adjacency_list;
pub mod error;
pub mod ghost;
pub mod graph;
pub mod index_space;
pub mod message;
pub mod patch;
pub mod scheduler;
pub mod task;
pub mod transfer;
pub mod variable;
pub mod warehouse;

pub use error::{Error, Result};
pub use graph::TaskGraph;
pub use patch::{Grid, Patch};
pub use scheduler::Scheduler;
pub use task::{Access, Kernel, Registry, Task, TaskContext, TaskSpec};
pub use variable::{Field, Staggering, VarLabel};
pub use warehouse::{DataWarehouse, Generation};
